//! Notification dispatch stage.
//!
//! Every notifier is called concurrently for each listing. A notifier
//! failure is logged and counted; it never drops the listing, so the
//! listing is still marked seen by a later persist stage.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::{AppError, Result};
use crate::models::Listing;
use crate::pipeline::stage::{Capability, Stage, Verdict};
use crate::services::Notifier;

pub struct NotifyStage {
    notifiers: Vec<Arc<dyn Notifier>>,
    template: String,
    timeout: Duration,
    sent: AtomicUsize,
    failed: AtomicUsize,
}

impl NotifyStage {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            notifiers,
            template: template.into(),
            timeout,
            sent: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    async fn send_one(&self, notifier: &dyn Notifier, message: &str, listing: &Listing) -> Result<()> {
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, notifier.send(message, Some(listing))).await {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout(
                format!("notify:{}", notifier.name()),
                start.elapsed(),
            )),
        }
    }
}

#[async_trait]
impl Stage for NotifyStage {
    fn name(&self) -> &str {
        "notify"
    }

    fn capability(&self) -> Capability {
        Capability::Notify
    }

    async fn process(&self, listing: &Listing) -> Result<Verdict> {
        let message = listing.format(&self.template);

        let results = join_all(
            self.notifiers
                .iter()
                .map(|n| self.send_one(n.as_ref(), &message, listing)),
        )
        .await;

        for (notifier, result) in self.notifiers.iter().zip(results) {
            match result {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "[notify] {} failed for {}: {}",
                        notifier.name(),
                        listing.global_id(),
                        e
                    );
                }
            }
        }
        Ok(Verdict::keep())
    }

    async fn finish(&self) -> Result<()> {
        let sent = self.sent.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        if sent + failed > 0 {
            log::info!("Sent {} notifications, {} failed", sent, failed);
        }
        Ok(())
    }
}
