// src/error.rs

//! Unified error handling for the listing watcher.
//!
//! Pipeline-level failures are scoped: a `Source` error empties one source
//! for one cycle, a `Stage` error drops one listing, a `Notifier` error is
//! logged for one notifier and one listing, and a `Store` error leaves one
//! listing unmarked. Only `CommitEscalation` describes a whole cycle.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// A source could not produce listings this cycle
    #[error("Source '{source_name}' failed: {message}")]
    Source {
        source_name: String,
        message: String,
    },

    /// A stage failed while processing one listing
    #[error("Stage '{stage}' failed for {listing}: {message}")]
    Stage {
        stage: String,
        listing: String,
        message: String,
    },

    /// A notifier could not deliver a message
    #[error("Notifier '{notifier}' failed: {message}")]
    Notifier { notifier: String, message: String },

    /// The seen-id store could not durably commit
    #[error("Store error: {0}")]
    Store(String),

    /// An external call exceeded its time budget
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// Too many commits failed within one cycle
    #[error(
        "Commit escalation: {failed} of {attempted} commits failed ({failure_percent:.1}% > {threshold_percent}%)"
    )]
    CommitEscalation {
        failed: usize,
        attempted: usize,
        failure_percent: f64,
        threshold_percent: u8,
    },
}

impl AppError {
    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a source error.
    pub fn source(source_name: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }

    /// Create a stage error for a listing.
    pub fn stage(
        stage: impl Into<String>,
        listing: impl fmt::Display,
        message: impl fmt::Display,
    ) -> Self {
        Self::Stage {
            stage: stage.into(),
            listing: listing.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a notifier error.
    pub fn notifier(notifier: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Notifier {
            notifier: notifier.into(),
            message: message.to_string(),
        }
    }

    /// Create a store error.
    pub fn store(message: impl fmt::Display) -> Self {
        Self::Store(message.to_string())
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }
}
