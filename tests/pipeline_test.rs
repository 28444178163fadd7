//! End-to-end behaviour of the pipeline, the id store and the scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use flatwatch::config::{ConfigLoader, StaticConfig};
use flatwatch::error::{AppError, Result};
use flatwatch::models::{Config, GlobalId, Listing};
use flatwatch::pipeline::{Annotations, Enricher, FilterRuleSet, Pipeline};
use flatwatch::scheduler::{ManualClock, PollScheduler, Shutdown, SystemClock, Tick};
use flatwatch::services::{Notifier, PluginRegistry, Source, SourceQuery};
use flatwatch::storage::{ExpiryBasis, IdStore, LocalIdStore, MemoryIdStore, StoreStats};

// --- Test doubles ---

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(String, Option<String>)>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn listing_ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, id)| id.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn send(&self, message: &str, listing: Option<&Listing>) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((message.to_string(), listing.map(|l| l.id.to_string())));
        Ok(())
    }
}

struct Refusing;

#[async_trait]
impl Notifier for Refusing {
    fn name(&self) -> &str {
        "refusing"
    }

    async fn send(&self, _message: &str, _listing: Option<&Listing>) -> Result<()> {
        Err(AppError::notifier("refusing", "503 Service Unavailable"))
    }
}

/// Fails for listings whose id is in the list.
struct Geocoder {
    fail_for: Vec<String>,
}

#[async_trait]
impl Enricher for Geocoder {
    fn name(&self) -> &str {
        "geocode"
    }

    async fn enrich(&self, listing: &Listing) -> Result<Annotations> {
        if self.fail_for.contains(&listing.id.to_string()) {
            return Err(AppError::validation("address not found"));
        }
        Ok(vec![("lat".to_string(), "52.52".to_string())])
    }
}

struct FixedSource {
    listings: Vec<Listing>,
    calls: AtomicUsize,
    fail: bool,
}

impl FixedSource {
    fn new(listings: Vec<Listing>) -> Self {
        Self {
            listings,
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            listings: Vec::new(),
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }
}

#[async_trait]
impl Source for FixedSource {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn fetch(&self, _query: &SourceQuery) -> Result<Vec<Listing>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AppError::source("fixed", "connection reset"));
        }
        Ok(self.listings.clone())
    }
}

/// Store whose commits always fail.
struct BrokenStore;

#[async_trait]
impl IdStore for BrokenStore {
    async fn is_seen(&self, _id: &GlobalId) -> Result<bool> {
        Ok(false)
    }

    async fn mark_seen(&self, _id: &GlobalId, _at: DateTime<Utc>) -> Result<()> {
        Err(AppError::store("No space left on device"))
    }

    async fn touch(&self, _id: &GlobalId, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn prune(&self, _before: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats::default())
    }
}

/// Returns the first configuration, then fails.
struct FlakyLoader {
    config: Config,
    calls: AtomicUsize,
}

impl ConfigLoader for FlakyLoader {
    fn load(&self) -> Result<Config> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(self.config.clone())
        } else {
            Err(AppError::config("config.toml: unexpected end of file"))
        }
    }
}

// --- Helpers ---

fn flats(ids: &[i64]) -> Vec<Listing> {
    ids.iter()
        .map(|id| {
            Listing::new("immo", *id, format!("Flat {id}"), format!("https://example.com/expose/{id}"))
                .with_price("900 €")
                .with_size("60 m²")
                .with_rooms("2")
        })
        .collect()
}

fn ts(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, day, hour, minute, 0).unwrap()
}

fn chain(store: Arc<dyn IdStore>, notifiers: Vec<Arc<dyn Notifier>>) -> Pipeline {
    Pipeline::builder()
        .dedup(store.clone(), Arc::new(SystemClock))
        .filter(FilterRuleSet::default())
        .notify(notifiers, "{title} {price}", Duration::from_secs(5))
        .persist(store, Arc::new(SystemClock))
        .build()
        .unwrap()
}

const SCHEDULED: &str = r#"
    [loop]
    active = true
    period_secs = 600
    pause = { from = "23:00", till = "07:00" }

    [notify]
    enabled = ["recorder"]

    [[sources]]
    name = "alpha"
    kind = "fixed-alpha"
    urls = ["mem://alpha"]

    [[sources]]
    name = "beta"
    kind = "fixed-beta"
    urls = ["mem://beta"]
"#;

fn registry(alpha: Arc<FixedSource>, beta: Arc<FixedSource>, recorder: Arc<Recorder>) -> PluginRegistry {
    let mut registry = PluginRegistry::with_defaults();
    registry.register_source("fixed-alpha", move |_, _| Ok(alpha.clone() as Arc<dyn Source>));
    registry.register_source("fixed-beta", move |_, _| Ok(beta.clone() as Arc<dyn Source>));
    registry.register_notifier("recorder", move |_, _, _| Ok(recorder.clone() as Arc<dyn Notifier>));
    registry
}

// --- Tests ---

#[tokio::test]
async fn dedup_is_idempotent_across_runs_and_restarts() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("seen.jsonl");
    let recorder = Arc::new(Recorder::default());

    let store: Arc<dyn IdStore> = Arc::new(LocalIdStore::open(&path, ExpiryBasis::FirstSeen).await.unwrap());
    let first = chain(store, vec![recorder.clone()])
        .run(flats(&[1, 2, 3]), &Shutdown::new())
        .await;
    assert_eq!(first.emitted.len(), 3);
    assert_eq!(first.committed, 3);

    // Reopened from disk
    let second = chain(first_store(&path).await, vec![recorder.clone()])
        .run(flats(&[1, 2, 3]), &Shutdown::new())
        .await;
    assert!(second.emitted.is_empty());
    assert_eq!(second.dropped.get("dedup"), Some(&3));

    // A new listing among known ones
    let third = chain(first_store(&path).await, vec![recorder.clone()])
        .run(flats(&[2, 4, 3]), &Shutdown::new())
        .await;
    let ids: Vec<String> = third.emitted.iter().map(|l| l.id.to_string()).collect();
    assert_eq!(ids, vec!["4"]);

    assert_eq!(recorder.listing_ids(), vec!["1", "2", "3", "4"]);
}

async fn first_store(path: &std::path::Path) -> Arc<dyn IdStore> {
    Arc::new(LocalIdStore::open(path, ExpiryBasis::FirstSeen).await.unwrap())
}

#[tokio::test]
async fn failing_enrichment_only_affects_its_listing() {
    let store = Arc::new(MemoryIdStore::new());
    let recorder = Arc::new(Recorder::default());

    let pipeline = Pipeline::builder()
        .concurrency(3)
        .dedup(store.clone(), Arc::new(SystemClock))
        .enrich(
            Geocoder {
                fail_for: vec!["2".into()],
            },
            Duration::from_secs(5),
        )
        .notify(vec![recorder.clone()], "{title} @ {lat}", Duration::from_secs(5))
        .persist(store.clone(), Arc::new(SystemClock))
        .build()
        .unwrap();

    let report = pipeline.run(flats(&[1, 2, 3]), &Shutdown::new()).await;

    assert_eq!(report.failures.get("enrich:geocode"), Some(&1));
    assert_eq!(recorder.listing_ids(), vec!["1", "3"]);
    assert!(report.emitted.iter().all(|l| l.annotation("lat") == Some("52.52")));

    // The failed listing stays unmarked and is retried next cycle
    assert!(!store.is_seen(&GlobalId::new("immo", 2)).await.unwrap());
    assert!(store.is_seen(&GlobalId::new("immo", 3)).await.unwrap());
}

#[tokio::test]
async fn notifier_failure_neither_blocks_others_nor_prevents_marking() {
    let store = Arc::new(MemoryIdStore::new());
    let recorder = Arc::new(Recorder::default());
    let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(Refusing), recorder.clone()];

    let report = chain(store.clone(), notifiers)
        .run(flats(&[10, 11]), &Shutdown::new())
        .await;

    assert_eq!(recorder.count(), 2);
    assert_eq!(report.committed, 2);
    assert!(report.failures.is_empty());
    assert!(store.is_seen(&GlobalId::new("immo", 10)).await.unwrap());
}

#[tokio::test]
async fn pruning_removes_only_records_before_threshold() {
    let store = Arc::new(MemoryIdStore::new());
    let threshold = ts(10, 12, 0);

    store.mark_seen(&GlobalId::new("immo", 1), ts(9, 12, 0)).await.unwrap();
    store.mark_seen(&GlobalId::new("immo", 2), threshold).await.unwrap();
    store.mark_seen(&GlobalId::new("immo", 3), ts(11, 12, 0)).await.unwrap();

    assert_eq!(store.prune(threshold).await.unwrap(), 1);

    // Only the pruned listing is reported again
    let recorder = Arc::new(Recorder::default());
    let report = chain(store.clone(), vec![recorder.clone()])
        .run(flats(&[1, 2, 3]), &Shutdown::new())
        .await;
    let ids: Vec<String> = report.emitted.iter().map(|l| l.id.to_string()).collect();
    assert_eq!(ids, vec!["1"]);
}

#[tokio::test]
async fn quiet_window_defers_fetching_until_it_ends() {
    let alpha = Arc::new(FixedSource::new(flats(&[1])));
    let beta = Arc::new(FixedSource::new(flats(&[2])));
    let recorder = Arc::new(Recorder::default());
    let clock = Arc::new(ManualClock::new(ts(4, 23, 30)));

    let config = Config::from_toml_str(SCHEDULED).unwrap();
    let mut scheduler = PollScheduler::new(
        StaticConfig(config),
        registry(alpha.clone(), beta.clone(), recorder.clone()),
        Arc::new(MemoryIdStore::new()),
    )
    .with_clock(clock.clone());

    match scheduler.tick().await.unwrap() {
        Tick::Paused { resume_in } => assert_eq!(resume_in, Duration::from_secs(450 * 60)),
        other => panic!("expected pause, got {other:?}"),
    }
    assert_eq!(alpha.calls.load(Ordering::SeqCst), 0);

    clock.set(ts(5, 6, 59));
    assert!(matches!(scheduler.tick().await.unwrap(), Tick::Paused { .. }));
    assert_eq!(alpha.calls.load(Ordering::SeqCst), 0);

    clock.set(ts(5, 7, 0));
    assert!(matches!(scheduler.tick().await.unwrap(), Tick::Ran(_)));
    assert_eq!(alpha.calls.load(Ordering::SeqCst), 1);
    assert_eq!(beta.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_source_does_not_block_others() {
    let alpha = Arc::new(FixedSource::failing());
    let beta = Arc::new(FixedSource::new(flats(&[1, 2])));
    let recorder = Arc::new(Recorder::default());
    let clock = Arc::new(ManualClock::new(ts(4, 12, 0)));
    let store = Arc::new(MemoryIdStore::new());

    let config = Config::from_toml_str(SCHEDULED).unwrap();
    let mut scheduler = PollScheduler::new(
        StaticConfig(config),
        registry(alpha, beta, recorder.clone()),
        store.clone(),
    )
    .with_clock(clock);

    let Tick::Ran(report) = scheduler.tick().await.unwrap() else {
        panic!("expected a cycle");
    };
    assert_eq!(report.source_failures, 1);
    assert_eq!(report.sources_ok, 1);
    assert_eq!(report.pipeline.emitted.len(), 2);
    assert_eq!(recorder.count(), 2);

    // Records are keyed by the configured source name
    assert!(store.is_seen(&GlobalId::new("beta", 1)).await.unwrap());
    assert!(!store.is_seen(&GlobalId::new("immo", 1)).await.unwrap());
}

#[tokio::test]
async fn failing_commits_escalate_the_cycle() {
    let alpha = Arc::new(FixedSource::new(flats(&[1, 2, 3])));
    let beta = Arc::new(FixedSource::new(Vec::new()));
    let recorder = Arc::new(Recorder::default());

    let config = Config::from_toml_str(SCHEDULED).unwrap();
    let mut scheduler = PollScheduler::new(
        StaticConfig(config),
        registry(alpha, beta, recorder.clone()),
        Arc::new(BrokenStore),
    )
    .with_clock(Arc::new(ManualClock::new(ts(4, 12, 0))));

    match scheduler.tick().await.unwrap() {
        Tick::Failed(AppError::CommitEscalation {
            failed, attempted, ..
        }) => {
            assert_eq!(failed, 3);
            assert_eq!(attempted, 3);
        }
        other => panic!("expected commit escalation, got {other:?}"),
    }
    // Notification still happened before the failed commits
    assert_eq!(recorder.count(), 3);
}

#[tokio::test]
async fn config_reload_failure_keeps_last_good_config() {
    let alpha = Arc::new(FixedSource::new(flats(&[1])));
    let beta = Arc::new(FixedSource::new(flats(&[2])));
    let recorder = Arc::new(Recorder::default());
    let loader = FlakyLoader {
        config: Config::from_toml_str(SCHEDULED).unwrap(),
        calls: AtomicUsize::new(0),
    };

    let mut scheduler = PollScheduler::new(
        loader,
        registry(alpha.clone(), beta, recorder),
        Arc::new(MemoryIdStore::new()),
    )
    .with_clock(Arc::new(ManualClock::new(ts(4, 12, 0))));

    assert!(matches!(scheduler.tick().await.unwrap(), Tick::Ran(_)));
    assert!(matches!(scheduler.tick().await.unwrap(), Tick::Ran(_)));
    assert_eq!(alpha.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn first_config_failure_is_fatal() {
    struct Broken;

    impl ConfigLoader for Broken {
        fn load(&self) -> Result<Config> {
            Err(AppError::config("missing config.toml"))
        }
    }

    let mut scheduler = PollScheduler::new(
        Broken,
        PluginRegistry::with_defaults(),
        Arc::new(MemoryIdStore::new()),
    );
    assert!(matches!(scheduler.tick().await, Err(AppError::Config(_))));
}

#[tokio::test]
async fn unknown_enricher_is_rejected_before_fetching() {
    let alpha = Arc::new(FixedSource::new(flats(&[1])));
    let beta = Arc::new(FixedSource::new(Vec::new()));
    let recorder = Arc::new(Recorder::default());

    let mut config = Config::from_toml_str(SCHEDULED).unwrap();
    config.pipeline.stages = ["dedup", "enrich:geocode", "notify", "persist"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert!(config.validate().is_ok());

    let mut scheduler = PollScheduler::new(
        StaticConfig(config.clone()),
        registry(alpha.clone(), beta.clone(), recorder.clone()),
        Arc::new(MemoryIdStore::new()),
    )
    .with_clock(Arc::new(ManualClock::new(ts(4, 12, 0))));
    assert!(matches!(scheduler.tick().await, Err(AppError::Config(_))));
    assert_eq!(alpha.calls.load(Ordering::SeqCst), 0);

    let mut with_geocoder = registry(alpha.clone(), beta, recorder.clone());
    with_geocoder.register_enricher(Arc::new(Geocoder { fail_for: Vec::new() }));
    let mut scheduler = PollScheduler::new(
        StaticConfig(config),
        with_geocoder,
        Arc::new(MemoryIdStore::new()),
    )
    .with_clock(Arc::new(ManualClock::new(ts(4, 12, 0))));
    assert!(matches!(scheduler.tick().await.unwrap(), Tick::Ran(_)));
    assert_eq!(alpha.calls.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.listing_ids(), vec!["1"]);
}

#[tokio::test]
async fn heartbeat_goes_to_every_notifier_once_per_interval() {
    let alpha = Arc::new(FixedSource::new(Vec::new()));
    let beta = Arc::new(FixedSource::new(Vec::new()));
    let recorder = Arc::new(Recorder::default());
    let clock = Arc::new(ManualClock::new(ts(4, 12, 0)));

    let mut config = Config::from_toml_str(SCHEDULED).unwrap();
    config.notify.heartbeat = Some("hour".into());
    let mut scheduler = PollScheduler::new(
        StaticConfig(config),
        registry(alpha, beta, recorder.clone()),
        Arc::new(MemoryIdStore::new()),
    )
    .with_clock(clock.clone());

    let Tick::Ran(report) = scheduler.tick().await.unwrap() else {
        panic!("expected a cycle");
    };
    assert!(report.heartbeat_sent);

    clock.set(ts(4, 12, 30));
    scheduler.tick().await.unwrap();
    clock.set(ts(4, 13, 0));
    scheduler.tick().await.unwrap();

    // Heartbeats carry no listing
    assert_eq!(recorder.count(), 2);
    assert!(recorder.listing_ids().is_empty());
}
