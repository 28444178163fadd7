// src/pipeline/pipeline.rs

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::error::{AppError, Result};
use crate::models::Listing;
use crate::scheduler::{Clock, Shutdown};
use crate::services::Notifier;
use crate::storage::IdStore;

use super::commit_guard::{CommitGuard, CommitGuardConfig};
use super::dedup::DedupStage;
use super::enrich::{EnrichStage, Enricher, MapStage, PricePerSquare};
use super::filter::{FilterRuleSet, FilterStage};
use super::notify::NotifyStage;
use super::persist::PersistStage;
use super::stage::{Annotations, Capability, Stage, StageSpec, Verdict, check_order};

/// Everything needed to build stages from configured stage keys.
pub struct PipelineContext {
    pub store: Arc<dyn IdStore>,
    pub clock: Arc<dyn Clock>,
    pub filters: FilterRuleSet,
    pub notifiers: Vec<Arc<dyn Notifier>>,
    /// Enrichers available to `enrich:<name>` stages
    pub enrichers: HashMap<String, Arc<dyn Enricher>>,
    pub message: String,
    pub notify_timeout: Duration,
    pub enrich_timeout: Duration,
    pub concurrency: usize,
    pub commit_guard: CommitGuardConfig,
}

/// Summary of one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Listings handed to the pipeline
    pub received: usize,
    /// In-batch duplicates collapsed before the first stage
    pub duplicates: usize,
    /// Listings that passed every stage
    pub emitted: Vec<Listing>,
    /// Drops per stage name
    pub dropped: BTreeMap<String, usize>,
    /// Errors per stage name
    pub failures: BTreeMap<String, usize>,
    pub committed: usize,
    pub commit_failures: usize,
    /// Listings skipped because of shutdown
    pub cancelled: usize,
}

impl PipelineReport {
    pub fn total_dropped(&self) -> usize {
        self.dropped.values().sum()
    }

    pub fn total_failures(&self) -> usize {
        self.failures.values().sum()
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
    concurrency: usize,
    guard: CommitGuardConfig,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            concurrency: 1,
            guard: CommitGuardConfig::default(),
        }
    }

    /// Listings processed concurrently within one stage.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn commit_guard(mut self, config: CommitGuardConfig) -> Self {
        self.guard = config;
        self
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn dedup(self, store: Arc<dyn IdStore>, clock: Arc<dyn Clock>) -> Self {
        self.stage(DedupStage::new(store, clock))
    }

    pub fn filter(self, rules: FilterRuleSet) -> Self {
        self.stage(FilterStage::new(rules))
    }

    pub fn enrich(self, enricher: impl Enricher + 'static, timeout: Duration) -> Self {
        self.stage(EnrichStage::new(enricher, timeout))
    }

    pub fn map<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Listing) -> Result<Annotations> + Send + Sync + 'static,
    {
        self.stage(MapStage::new(name, f))
    }

    pub fn notify(
        self,
        notifiers: Vec<Arc<dyn Notifier>>,
        template: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        self.stage(NotifyStage::new(notifiers, template, timeout))
    }

    pub fn persist(self, store: Arc<dyn IdStore>, clock: Arc<dyn Clock>) -> Self {
        self.stage(PersistStage::new(store, clock))
    }

    /// Check stage ordering and freeze the chain.
    pub fn build(self) -> Result<Pipeline> {
        let order: Vec<(String, Capability)> = self
            .stages
            .iter()
            .map(|s| (s.name().to_string(), s.capability()))
            .collect();
        check_order(&order)?;

        Ok(Pipeline {
            stages: self.stages,
            concurrency: self.concurrency,
            guard: CommitGuard::with_config(self.guard),
        })
    }
}

/// An immutable, ordered chain of stages.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    concurrency: usize,
    guard: CommitGuard,
}

enum Step {
    Done(Result<Verdict>),
    Cancelled,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Build the chain described by configured stage keys.
    pub fn from_specs(specs: &[StageSpec], ctx: &PipelineContext) -> Result<Self> {
        let mut builder = PipelineBuilder::new()
            .concurrency(ctx.concurrency)
            .commit_guard(ctx.commit_guard.clone());

        for spec in specs {
            builder = match spec {
                StageSpec::Dedup => builder.dedup(ctx.store.clone(), ctx.clock.clone()),
                StageSpec::Filter => builder.filter(ctx.filters.clone()),
                StageSpec::PricePerSquare => builder.enrich(PricePerSquare, ctx.enrich_timeout),
                StageSpec::Enrich(name) => {
                    let enricher = ctx.enrichers.get(name).ok_or_else(|| {
                        AppError::config(format!("pipeline.stages: no enricher named '{name}'"))
                    })?;
                    builder.stage(EnrichStage::boxed(
                        Box::new(SharedEnricher(enricher.clone())),
                        ctx.enrich_timeout,
                    ))
                }
                StageSpec::Notify => builder.notify(
                    ctx.notifiers.clone(),
                    ctx.message.clone(),
                    ctx.notify_timeout,
                ),
                StageSpec::Persist => builder.persist(ctx.store.clone(), ctx.clock.clone()),
            };
        }

        builder.build()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run a batch of listings through every stage.
    ///
    /// Stage errors and drops only affect the listing concerned. Order of
    /// the surviving listings is preserved. Shutdown cancels listings up to
    /// the notify stage; once notified, a listing runs on to persist.
    pub async fn run(&self, listings: Vec<Listing>, shutdown: &Shutdown) -> PipelineReport {
        let mut report = PipelineReport {
            received: listings.len(),
            ..PipelineReport::default()
        };

        let mut seen = HashSet::new();
        let mut current = Vec::with_capacity(listings.len());
        for listing in listings {
            if seen.insert(listing.global_id()) {
                current.push(listing);
            } else {
                report.duplicates += 1;
            }
        }

        let mut notified = false;
        for stage in &self.stages {
            let stage = stage.as_ref();
            let name = stage.name();
            let is_persist = stage.capability() == Capability::Persist;
            let cancellable = !notified;

            let results: Vec<(Listing, Step)> = stream::iter(current)
                .map(|listing| async move {
                    if cancellable && shutdown.is_triggered() {
                        return (listing, Step::Cancelled);
                    }
                    let result = stage.process(&listing).await;
                    (listing, Step::Done(result))
                })
                .buffered(self.concurrency)
                .collect()
                .await;

            let mut next = Vec::with_capacity(results.len());
            for (mut listing, step) in results {
                match step {
                    Step::Cancelled => report.cancelled += 1,
                    Step::Done(Ok(Verdict::Keep(annotations))) => {
                        for (key, value) in annotations {
                            listing.annotate(key, value);
                        }
                        if is_persist {
                            report.committed += 1;
                        }
                        next.push(listing);
                    }
                    Step::Done(Ok(Verdict::Drop(reason))) => {
                        log::debug!("[{}] dropped {}: {}", name, listing.global_id(), reason);
                        *report.dropped.entry(name.to_string()).or_default() += 1;
                    }
                    Step::Done(Err(e)) => {
                        log::warn!("{}", AppError::stage(name, listing.global_id(), e));
                        *report.failures.entry(name.to_string()).or_default() += 1;
                        if is_persist {
                            report.commit_failures += 1;
                        }
                    }
                }
            }

            if let Err(e) = stage.finish().await {
                log::error!("[{}] finish failed: {}", name, e);
                *report.failures.entry(name.to_string()).or_default() += 1;
            }
            if stage.capability() == Capability::Notify {
                notified = true;
            }
            current = next;
        }

        report.emitted = current;
        report
    }

    /// Escalate when too many commits of a run failed.
    pub fn check_commits(&self, report: &PipelineReport) -> Result<()> {
        self.guard.validate(
            report.committed + report.commit_failures,
            report.commit_failures,
        )
    }
}

/// Lets a registry-owned enricher back an [`EnrichStage`].
struct SharedEnricher(Arc<dyn Enricher>);

#[async_trait::async_trait]
impl Enricher for SharedEnricher {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn enrich(&self, listing: &Listing) -> Result<Annotations> {
        self.0.enrich(listing).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::scheduler::SystemClock;
    use crate::storage::MemoryIdStore;

    fn listings(ids: &[i64]) -> Vec<Listing> {
        ids.iter()
            .map(|id| Listing::new("immo", *id, format!("Flat {id}"), format!("https://x/{id}")))
            .collect()
    }

    #[tokio::test]
    async fn test_in_batch_duplicates_collapse() {
        let pipeline = Pipeline::builder().build().unwrap();
        let report = pipeline.run(listings(&[1, 2, 1, 3, 2]), &Shutdown::new()).await;

        assert_eq!(report.received, 5);
        assert_eq!(report.duplicates, 2);
        let ids: Vec<String> = report.emitted.iter().map(|l| l.id.to_string()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_stage_error_drops_only_that_listing() {
        let pipeline = Pipeline::builder()
            .concurrency(4)
            .map("flaky", |l: &Listing| {
                if l.id.to_string() == "2" {
                    Err(AppError::validation("geocoder refused"))
                } else {
                    Ok(vec![("checked".to_string(), "yes".to_string())])
                }
            })
            .build()
            .unwrap();

        let report = pipeline.run(listings(&[1, 2, 3]), &Shutdown::new()).await;
        assert_eq!(report.emitted.len(), 2);
        assert_eq!(report.failures.get("flaky"), Some(&1));
        assert!(report.emitted.iter().all(|l| l.annotation("checked") == Some("yes")));
    }

    /// Records messages and triggers shutdown on the first one.
    struct Interrupting {
        shutdown: Shutdown,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Notifier for Interrupting {
        fn name(&self) -> &str {
            "interrupting"
        }

        async fn send(&self, message: &str, _listing: Option<&Listing>) -> Result<()> {
            self.shutdown.trigger();
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn delivery_chain(store: Arc<MemoryIdStore>, notifier: Arc<dyn Notifier>) -> Pipeline {
        Pipeline::builder()
            .dedup(store.clone(), Arc::new(SystemClock))
            .notify(vec![notifier], "{id}", Duration::from_secs(1))
            .persist(store, Arc::new(SystemClock))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_cancels_remaining_listings() {
        let store = Arc::new(MemoryIdStore::new());
        let notifier = Arc::new(Interrupting {
            shutdown: Shutdown::new(),
            sent: Mutex::new(Vec::new()),
        });
        let pipeline = delivery_chain(store.clone(), notifier.clone());
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let report = pipeline.run(listings(&[1, 2]), &shutdown).await;
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.committed, 0);
        assert!(notifier.sent.lock().unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().records, 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_notify_still_commits() {
        let store = Arc::new(MemoryIdStore::new());
        let shutdown = Shutdown::new();
        let notifier = Arc::new(Interrupting {
            shutdown: shutdown.clone(),
            sent: Mutex::new(Vec::new()),
        });
        let pipeline = delivery_chain(store.clone(), notifier.clone());

        let report = pipeline.run(listings(&[1]), &shutdown).await;
        assert!(shutdown.is_triggered());
        assert_eq!(report.cancelled, 0);
        assert_eq!(report.committed, 1);

        // Next run after restart: already seen, not sent again
        let report = pipeline.run(listings(&[1]), &Shutdown::new()).await;
        assert_eq!(report.committed, 0);
        assert_eq!(*notifier.sent.lock().unwrap(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_builder_rejects_stage_after_persist() {
        let store = Arc::new(MemoryIdStore::new());
        let result = Pipeline::builder()
            .persist(store, Arc::new(SystemClock))
            .filter(FilterRuleSet::default())
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_builder_rejects_commit_without_notify() {
        let store = Arc::new(MemoryIdStore::new());
        let result = Pipeline::builder()
            .dedup(store.clone(), Arc::new(SystemClock))
            .filter(FilterRuleSet::default())
            .persist(store, Arc::new(SystemClock))
            .build();
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_enricher_is_config_error() {
        let ctx = PipelineContext {
            store: Arc::new(MemoryIdStore::new()),
            clock: Arc::new(SystemClock),
            filters: FilterRuleSet::default(),
            notifiers: Vec::new(),
            enrichers: HashMap::new(),
            message: "{title}".into(),
            notify_timeout: Duration::from_secs(1),
            enrich_timeout: Duration::from_secs(1),
            concurrency: 1,
            commit_guard: CommitGuardConfig::default(),
        };
        let specs = vec![StageSpec::Enrich("geocode".into())];
        assert!(matches!(
            Pipeline::from_specs(&specs, &ctx),
            Err(AppError::Config(_))
        ));

        let specs: Vec<StageSpec> = ["dedup", "filter", "price_per_square", "notify", "persist"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let pipeline = Pipeline::from_specs(&specs, &ctx).unwrap();
        assert_eq!(
            pipeline.stage_names(),
            vec!["dedup", "filter", "enrich:price_per_square", "notify", "persist"]
        );
    }
}
