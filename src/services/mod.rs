//! Service layer: where listings come from and where notifications go.
//!
//! - Sources (`HtmlSource`, `JsonFeedSource`, `FileSource`) produce raw listings
//! - Notifiers (`ConsoleNotifier`, `WebhookNotifier`) deliver messages
//! - `PluginRegistry` maps configured `kind` keys to implementations

mod console;
mod feed;
mod html;
mod registry;
mod webhook;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Listing, SourceConfig};

pub use console::ConsoleNotifier;
pub use feed::{FileSource, JsonFeedSource, parse_feed};
pub use html::HtmlSource;
pub use registry::{NotifierFactory, PluginRegistry, SourceFactory};
pub use webhook::WebhookNotifier;

/// What to fetch from a source in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceQuery {
    /// Search result URLs, or file paths for file sources
    pub urls: Vec<String>,
}

impl From<&SourceConfig> for SourceQuery {
    fn from(config: &SourceConfig) -> Self {
        Self {
            urls: config.urls.clone(),
        }
    }
}

/// Produces raw listings for one site.
///
/// The scheduler stamps the configured source name onto every returned
/// listing, so implementations need not set `source_name`.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Listing>>;
}

/// Delivers a rendered message.
///
/// `listing` is `None` for messages not tied to a listing (heartbeats).
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &str, listing: Option<&Listing>) -> Result<()>;
}
