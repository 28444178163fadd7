//! Poll scheduler.
//!
//! Drives the cycle state machine:
//!
//! ```text
//! Idle → Fetching → Processing → Committing → Idle
//! ```
//!
//! Each cycle reloads the configuration, queries every enabled source
//! concurrently, runs the pipeline over the merged listings and finally
//! flushes the id store, prunes expired records and sends the heartbeat.
//! In loop mode cycles repeat every `loop.period_secs`, and no cycle starts
//! inside the quiet window.

mod clock;
mod heartbeat;
mod quiet;
mod shutdown;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use crate::config::ConfigLoader;
use crate::error::{AppError, Result};
use crate::models::{Config, Listing};
use crate::pipeline::{Pipeline, PipelineContext, PipelineReport};
use crate::services::{Notifier, PluginRegistry, Source, SourceQuery};
use crate::storage::IdStore;
use crate::utils::http::create_async_client;

pub use clock::{Clock, ManualClock, SystemClock};
pub use heartbeat::{Heartbeat, HeartbeatInterval};
pub use quiet::QuietWindow;
pub use shutdown::Shutdown;

/// Where the scheduler is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Fetching,
    Processing,
    Committing,
}

/// Summary of one cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Listings returned by all sources
    pub fetched: usize,
    pub sources_ok: usize,
    pub source_failures: usize,
    pub pipeline: PipelineReport,
    /// Records removed by retention
    pub pruned: usize,
    pub heartbeat_sent: bool,
}

/// Result of one scheduling decision.
#[derive(Debug)]
pub enum Tick {
    /// A cycle ran to completion
    Ran(CycleReport),
    /// Inside the quiet window; nothing was fetched
    Paused { resume_in: Duration },
    /// A cycle ran but must be reported as failed
    Failed(AppError),
}

pub struct PollScheduler {
    loader: Box<dyn ConfigLoader>,
    registry: PluginRegistry,
    store: Arc<dyn IdStore>,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
    /// Last configuration that loaded and validated
    config: Option<Config>,
    heartbeat: Heartbeat,
    state: CycleState,
    cycles: u64,
}

impl PollScheduler {
    pub fn new(
        loader: impl ConfigLoader + 'static,
        registry: PluginRegistry,
        store: Arc<dyn IdStore>,
    ) -> Self {
        Self {
            loader: Box::new(loader),
            registry,
            store,
            clock: Arc::new(SystemClock),
            shutdown: Shutdown::new(),
            config: None,
            heartbeat: Heartbeat::default(),
            state: CycleState::Idle,
            cycles: 0,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Loop until shutdown, or run a single cycle when the loop is inactive.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.shutdown.is_triggered() {
                log::info!("Shutdown requested, leaving scheduler");
                return Ok(());
            }

            let started = Instant::now();
            let tick = self.tick().await?;
            let (active, period) = self
                .config
                .as_ref()
                .map(|c| (c.schedule.active, Duration::from_secs(c.schedule.period_secs)))
                .unwrap_or((false, Duration::ZERO));

            let wait = match tick {
                Tick::Paused { resume_in } => {
                    log::info!(
                        "Quiet window, next cycle in {}s",
                        resume_in.as_secs()
                    );
                    resume_in
                }
                Tick::Ran(_) if !active => return Ok(()),
                Tick::Failed(e) if !active => return Err(e),
                Tick::Ran(_) | Tick::Failed(_) => period.saturating_sub(started.elapsed()),
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.wait() => {
                    log::info!("Shutdown requested during sleep");
                    return Ok(());
                }
            }
        }
    }

    /// Make one scheduling decision and act on it.
    ///
    /// Only fails when the very first configuration cannot be loaded.
    pub async fn tick(&mut self) -> Result<Tick> {
        let config = self.reload()?;

        if config.schedule.active {
            let window = QuietWindow::from_config(&config.schedule.pause)?;
            if let Some(left) = window.until_end(self.clock.local_now()) {
                return Ok(Tick::Paused {
                    resume_in: left.to_std().unwrap_or(Duration::ZERO),
                });
            }
        }

        Ok(match self.run_cycle(&config).await {
            Ok(report) => Tick::Ran(report),
            Err(e) => {
                log::error!("Cycle {} failed: {}", self.cycles, e);
                Tick::Failed(e)
            }
        })
    }

    /// Load the configuration, falling back to the last good one.
    ///
    /// A configuration naming an enricher the registry lacks counts as a
    /// failed load, so it is rejected before any source is queried.
    fn reload(&mut self) -> Result<Config> {
        let loaded = self.loader.load().and_then(|config| {
            self.registry.check_stages(&config.stage_specs()?)?;
            Ok(config)
        });
        match loaded {
            Ok(config) => {
                self.config = Some(config.clone());
                Ok(config)
            }
            Err(e) => match &self.config {
                Some(last) => {
                    log::warn!("Config reload failed, keeping previous configuration: {e}");
                    Ok(last.clone())
                }
                None => Err(e),
            },
        }
    }

    fn enter(&mut self, state: CycleState) {
        log::debug!("Cycle {}: {:?} -> {:?}", self.cycles, self.state, state);
        self.state = state;
    }

    async fn run_cycle(&mut self, config: &Config) -> Result<CycleReport> {
        self.cycles += 1;
        let client = create_async_client(&config.http)?;
        let mut report = CycleReport::default();

        // Fetching
        self.enter(CycleState::Fetching);
        let listings = self.fetch_all(config, &client, &mut report).await;
        report.fetched = listings.len();

        // Processing
        self.enter(CycleState::Processing);
        let notifiers = self.build_notifiers(config, &client);
        let ctx = PipelineContext {
            store: self.store.clone(),
            clock: self.clock.clone(),
            filters: config.filters.clone(),
            notifiers: notifiers.clone(),
            enrichers: self.registry.enrichers(),
            message: config.notify.message.clone(),
            notify_timeout: Duration::from_secs(config.notify.timeout_secs),
            enrich_timeout: Duration::from_secs(config.pipeline.enrich_timeout_secs),
            concurrency: config.pipeline.concurrency,
            commit_guard: config.pipeline.commit_guard.clone(),
        };
        let pipeline = match Pipeline::from_specs(&config.stage_specs()?, &ctx) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.enter(CycleState::Idle);
                return Err(e);
            }
        };
        report.pipeline = pipeline.run(listings, &self.shutdown).await;

        // Committing
        self.enter(CycleState::Committing);
        if let Err(e) = self.store.flush().await {
            log::error!("Store flush failed: {}", e);
        }
        let commits = pipeline.check_commits(&report.pipeline);

        if commits.is_ok() {
            report.pruned = self.prune(config).await;
        }
        report.heartbeat_sent = self.maybe_heartbeat(config, &notifiers).await;
        self.enter(CycleState::Idle);

        log::info!(
            "Cycle {}: {} fetched ({} sources ok, {} failed), {} new, {} dropped, {} stage errors, {} committed",
            self.cycles,
            report.fetched,
            report.sources_ok,
            report.source_failures,
            report.pipeline.emitted.len(),
            report.pipeline.total_dropped(),
            report.pipeline.total_failures(),
            report.pipeline.committed
        );

        commits.map(|()| report)
    }

    /// Query every enabled source concurrently; results keep source order.
    async fn fetch_all(
        &self,
        config: &Config,
        client: &reqwest::Client,
        report: &mut CycleReport,
    ) -> Vec<Listing> {
        let timeout = Duration::from_secs(config.pipeline.fetch_timeout_secs);
        let mut jobs: Vec<(String, Arc<dyn Source>, SourceQuery)> = Vec::new();

        for source_config in config.enabled_sources() {
            match self.registry.build_source(source_config, client) {
                Ok(source) => jobs.push((
                    source_config.name.clone(),
                    source,
                    SourceQuery::from(source_config),
                )),
                Err(e) => {
                    report.source_failures += 1;
                    log::error!("[{}] cannot build source: {}", source_config.name, e);
                }
            }
        }

        let shutdown = &self.shutdown;
        let results = join_all(jobs.iter().map(|(name, source, query)| async move {
            if shutdown.is_triggered() {
                return Err(AppError::source(name, "cancelled by shutdown"));
            }
            let start = Instant::now();
            match tokio::time::timeout(timeout, source.fetch(query)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::timeout(format!("fetch:{name}"), start.elapsed())),
            }
        }))
        .await;

        let mut listings = Vec::new();
        for ((name, _, _), result) in jobs.iter().zip(results) {
            match result {
                Ok(found) => {
                    report.sources_ok += 1;
                    log::info!("[{}] {} listings", name, found.len());
                    listings.extend(found.into_iter().map(|mut listing| {
                        listing.source_name = name.clone();
                        listing
                    }));
                }
                Err(e) => {
                    report.source_failures += 1;
                    log::warn!("[{}] fetch failed: {}", name, e);
                }
            }
        }
        listings
    }

    fn build_notifiers(&self, config: &Config, client: &reqwest::Client) -> Vec<Arc<dyn Notifier>> {
        config
            .notify
            .enabled
            .iter()
            .filter_map(|name| {
                match self
                    .registry
                    .build_notifier(name, &config.channel(name), client)
                {
                    Ok(notifier) => Some(notifier),
                    Err(e) => {
                        log::error!("[{}] cannot build notifier: {}", name, e);
                        None
                    }
                }
            })
            .collect()
    }

    async fn prune(&self, config: &Config) -> usize {
        let Some(days) = config.store.retention_days else {
            return 0;
        };
        let before = self.clock.now() - chrono::Duration::days(i64::from(days));
        match self.store.prune(before).await {
            Ok(removed) => removed,
            Err(e) => {
                log::error!("Store prune failed: {}", e);
                0
            }
        }
    }

    async fn maybe_heartbeat(&mut self, config: &Config, notifiers: &[Arc<dyn Notifier>]) -> bool {
        let Some(interval) = config
            .notify
            .heartbeat
            .as_deref()
            .and_then(|s| s.parse::<HeartbeatInterval>().ok())
        else {
            return false;
        };
        let now = self.clock.now();
        if !self.heartbeat.is_due(interval, now) {
            return false;
        }

        let message = Heartbeat::message(self.cycles, config.enabled_sources().count());
        let timeout = Duration::from_secs(config.notify.timeout_secs);
        let results = join_all(notifiers.iter().map(|n| {
            let message = message.as_str();
            async move {
                match tokio::time::timeout(timeout, n.send(message, None)).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::timeout(format!("heartbeat:{}", n.name()), timeout)),
                }
            }
        }))
        .await;

        for (notifier, result) in notifiers.iter().zip(results) {
            if let Err(e) = result {
                log::warn!("[{}] heartbeat failed: {}", notifier.name(), e);
            }
        }
        self.heartbeat.record(now);
        true
    }
}
