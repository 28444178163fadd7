//! Drops listings that were reported before.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Listing;
use crate::pipeline::stage::{Capability, Stage, Verdict};
use crate::scheduler::Clock;
use crate::storage::IdStore;

pub struct DedupStage {
    store: Arc<dyn IdStore>,
    clock: Arc<dyn Clock>,
}

impl DedupStage {
    pub fn new(store: Arc<dyn IdStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl Stage for DedupStage {
    fn name(&self) -> &str {
        "dedup"
    }

    fn capability(&self) -> Capability {
        Capability::Dedup
    }

    async fn process(&self, listing: &Listing) -> Result<Verdict> {
        let id = listing.global_id();
        if self.store.is_seen(&id).await? {
            // Keeps the record alive under last_seen retention
            self.store.touch(&id, self.clock.now()).await?;
            return Ok(Verdict::drop("already seen"));
        }
        Ok(Verdict::keep())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SystemClock;
    use crate::storage::MemoryIdStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_drops_seen_listing() {
        let store = Arc::new(MemoryIdStore::new());
        let stage = DedupStage::new(store.clone(), Arc::new(SystemClock));
        let listing = Listing::new("immo", 1, "Flat", "https://example.com/1");

        assert_eq!(stage.process(&listing).await.unwrap(), Verdict::keep());

        store
            .mark_seen(&listing.global_id(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            stage.process(&listing).await.unwrap(),
            Verdict::Drop(_)
        ));
    }
}
