// src/models/mod.rs

//! Domain models for the listing watcher.
//!
//! This module contains the listing record and the configuration
//! structures read from `config.toml`.

mod config;
mod listing;

// Re-export all public types
pub use config::{
    ChannelConfig, Config, HttpConfig, LoggingConfig, LoopConfig, NotifyConfig, PauseConfig,
    PipelineConfig, SelectorConfig, SourceConfig, StoreConfig,
};
pub use listing::{GlobalId, Listing, ListingId};
