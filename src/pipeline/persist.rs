//! Terminal stage: records listings as seen.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Listing;
use crate::pipeline::stage::{Capability, Stage, Verdict};
use crate::scheduler::Clock;
use crate::storage::IdStore;

pub struct PersistStage {
    store: Arc<dyn IdStore>,
    clock: Arc<dyn Clock>,
}

impl PersistStage {
    pub fn new(store: Arc<dyn IdStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl Stage for PersistStage {
    fn name(&self) -> &str {
        "persist"
    }

    fn capability(&self) -> Capability {
        Capability::Persist
    }

    async fn process(&self, listing: &Listing) -> Result<Verdict> {
        self.store
            .mark_seen(&listing.global_id(), self.clock.now())
            .await?;
        Ok(Verdict::keep())
    }

    async fn finish(&self) -> Result<()> {
        self.store.flush().await
    }
}
