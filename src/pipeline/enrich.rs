//! Enrichment stages.
//!
//! Enrichers compute extra data for a listing (coordinates, commute times,
//! derived metrics) and return it as annotations. They may call external
//! services, so every call is bounded by a timeout.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::Listing;
use crate::pipeline::filter::price_per_square;
use crate::pipeline::stage::{Annotations, Capability, Stage, Verdict};

/// Computes annotations for a listing.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    async fn enrich(&self, listing: &Listing) -> Result<Annotations>;
}

/// Runs an [`Enricher`] with a timeout.
pub struct EnrichStage {
    name: String,
    enricher: Box<dyn Enricher>,
    timeout: Duration,
}

impl EnrichStage {
    pub fn new(enricher: impl Enricher + 'static, timeout: Duration) -> Self {
        Self::boxed(Box::new(enricher), timeout)
    }

    pub fn boxed(enricher: Box<dyn Enricher>, timeout: Duration) -> Self {
        Self {
            name: format!("enrich:{}", enricher.name()),
            enricher,
            timeout,
        }
    }
}

#[async_trait]
impl Stage for EnrichStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::Enrich
    }

    async fn process(&self, listing: &Listing) -> Result<Verdict> {
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, self.enricher.enrich(listing)).await {
            Ok(result) => Ok(Verdict::Keep(result?)),
            Err(_) => Err(AppError::timeout(&self.name, start.elapsed())),
        }
    }
}

type MapFn = dyn Fn(&Listing) -> Result<Annotations> + Send + Sync;

/// Synchronous enrichment from a closure.
pub struct MapStage {
    name: String,
    f: Box<MapFn>,
}

impl MapStage {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Listing) -> Result<Annotations> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Stage for MapStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::Enrich
    }

    async fn process(&self, listing: &Listing) -> Result<Verdict> {
        Ok(Verdict::Keep((self.f)(listing)?))
    }
}

/// Annotates `price_per_square` when price and size are known.
#[derive(Debug, Clone, Copy, Default)]
pub struct PricePerSquare;

#[async_trait]
impl Enricher for PricePerSquare {
    fn name(&self) -> &str {
        "price_per_square"
    }

    async fn enrich(&self, listing: &Listing) -> Result<Annotations> {
        Ok(price_per_square(listing)
            .map(|value| vec![("price_per_square".to_string(), format!("{value:.2}"))])
            .unwrap_or_default())
    }
}
