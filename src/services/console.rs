//! Prints notifications to standard output.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::Listing;
use crate::services::Notifier;

pub struct ConsoleNotifier {
    name: String,
}

impl ConsoleNotifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ConsoleNotifier {
    fn default() -> Self {
        Self::new("console")
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &str, _listing: Option<&Listing>) -> Result<()> {
        let mut out = tokio::io::stdout();
        let block = format!("{message}\n\n");
        out.write_all(block.as_bytes())
            .await
            .map_err(|e| AppError::notifier(&self.name, e))?;
        out.flush()
            .await
            .map_err(|e| AppError::notifier(&self.name, e))
    }
}
