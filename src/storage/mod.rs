//! Seen-id storage: the dedup oracle.
//!
//! A listing is new exactly when its [`GlobalId`] is absent from the store.
//! Records are only ever removed by [`IdStore::prune`], which applies the
//! configured retention basis:
//!
//! - [`ExpiryBasis::FirstSeen`]: a record expires a fixed time after the
//!   listing was first reported.
//! - [`ExpiryBasis::LastSeen`]: the dedup stage refreshes `last_seen` every
//!   time a known listing shows up again, so a record expires only after the
//!   listing has been absent from every scrape for the retention period.
//!
//! ## Storage Layout
//!
//! ```text
//! data/
//! └── seen.jsonl      # one JSON record per line, later lines win
//! ```

pub mod local;
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::GlobalId;

// Re-export for convenience
pub use local::LocalIdStore;
pub use memory::MemoryIdStore;

/// Which timestamp retention is measured from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryBasis {
    #[default]
    FirstSeen,
    LastSeen,
}

/// Timestamps kept per seen listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenRecord {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SeenRecord {
    fn at(time: DateTime<Utc>) -> Self {
        Self {
            first_seen: time,
            last_seen: time,
        }
    }

    fn expiry_time(&self, basis: ExpiryBasis) -> DateTime<Utc> {
        match basis {
            ExpiryBasis::FirstSeen => self.first_seen,
            ExpiryBasis::LastSeen => self.last_seen,
        }
    }
}

/// Summary of the store contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub records: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Trait for seen-id storage backends.
///
/// One poll cycle runs at a time, so a store has a single logical writer;
/// implementations still serialize calls internally because stages may
/// process several listings concurrently.
#[async_trait]
pub trait IdStore: Send + Sync {
    /// Whether the listing has been recorded.
    async fn is_seen(&self, id: &GlobalId) -> Result<bool>;

    /// Record a listing as seen. Idempotent: the first timestamp is kept.
    ///
    /// Durable when it returns `Ok`.
    async fn mark_seen(&self, id: &GlobalId, at: DateTime<Utc>) -> Result<()>;

    /// Refresh the last-seen timestamp of a known listing.
    ///
    /// Not necessarily durable until [`IdStore::flush`].
    async fn touch(&self, id: &GlobalId, at: DateTime<Utc>) -> Result<()>;

    /// Remove records whose expiry timestamp is strictly before `before`.
    ///
    /// Returns the number of removed records. Durable when it returns `Ok`.
    async fn prune(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Persist pending touches.
    async fn flush(&self) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// In-memory index shared by the store backends.
#[derive(Debug, Clone, Default)]
pub(crate) struct SeenSet {
    records: HashMap<GlobalId, SeenRecord>,
}

impl SeenSet {
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn contains(&self, id: &GlobalId) -> bool {
        self.records.contains_key(id)
    }

    pub(crate) fn get(&self, id: &GlobalId) -> Option<&SeenRecord> {
        self.records.get(id)
    }

    /// Insert a new record; returns false when the id was already present.
    pub(crate) fn insert_new(&mut self, id: &GlobalId, at: DateTime<Utc>) -> bool {
        if self.records.contains_key(id) {
            return false;
        }
        self.records.insert(id.clone(), SeenRecord::at(at));
        true
    }

    /// Fold a persisted record into the index, keeping the widest time span.
    pub(crate) fn merge(&mut self, id: GlobalId, record: SeenRecord) {
        self.records
            .entry(id)
            .and_modify(|existing| {
                existing.first_seen = existing.first_seen.min(record.first_seen);
                existing.last_seen = existing.last_seen.max(record.last_seen);
            })
            .or_insert(record);
    }

    /// Move `last_seen` forward; returns false for unknown ids.
    pub(crate) fn touch(&mut self, id: &GlobalId, at: DateTime<Utc>) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.last_seen = record.last_seen.max(at);
                true
            }
            None => false,
        }
    }

    /// Copy of the index without the records expiring before `before`.
    pub(crate) fn retained(&self, before: DateTime<Utc>, basis: ExpiryBasis) -> SeenSet {
        SeenSet {
            records: self
                .records
                .iter()
                .filter(|(_, record)| record.expiry_time(basis) >= before)
                .map(|(id, record)| (id.clone(), *record))
                .collect(),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&GlobalId, &SeenRecord)> {
        self.records.iter()
    }

    pub(crate) fn stats(&self) -> StoreStats {
        StoreStats {
            records: self.records.len(),
            oldest: self.records.values().map(|r| r.first_seen).min(),
            newest: self.records.values().map(|r| r.first_seen).max(),
        }
    }
}
