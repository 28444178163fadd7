//! In-memory id store for tests and dry runs.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::GlobalId;
use crate::storage::{ExpiryBasis, IdStore, SeenSet, StoreStats};

/// Volatile [`IdStore`]; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryIdStore {
    basis: ExpiryBasis,
    seen: Mutex<SeenSet>,
}

impl MemoryIdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_basis(basis: ExpiryBasis) -> Self {
        Self {
            basis,
            seen: Mutex::new(SeenSet::default()),
        }
    }

    fn with_seen<T>(&self, f: impl FnOnce(&mut SeenSet) -> T) -> Result<T> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| AppError::store("memory store lock poisoned"))?;
        Ok(f(&mut seen))
    }
}

#[async_trait]
impl IdStore for MemoryIdStore {
    async fn is_seen(&self, id: &GlobalId) -> Result<bool> {
        self.with_seen(|seen| seen.contains(id))
    }

    async fn mark_seen(&self, id: &GlobalId, at: DateTime<Utc>) -> Result<()> {
        self.with_seen(|seen| {
            seen.insert_new(id, at);
        })
    }

    async fn touch(&self, id: &GlobalId, at: DateTime<Utc>) -> Result<()> {
        self.with_seen(|seen| {
            seen.touch(id, at);
        })
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<usize> {
        let basis = self.basis;
        self.with_seen(|seen| {
            let retained = seen.retained(before, basis);
            let removed = seen.len() - retained.len();
            *seen = retained;
            removed
        })
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.with_seen(|seen| seen.stats())
    }
}
