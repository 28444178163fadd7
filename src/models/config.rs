//! Application configuration structures.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::pipeline::{CommitGuardConfig, FilterRuleSet, StageSpec};
use crate::scheduler::{HeartbeatInterval, QuietWindow};
use crate::storage::ExpiryBasis;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Log verbosity
    #[serde(default)]
    pub logging: LoggingConfig,

    /// HTTP client settings shared by sources and notifiers
    #[serde(default)]
    pub http: HttpConfig,

    /// Polling loop and quiet window
    #[serde(default, rename = "loop")]
    pub schedule: LoopConfig,

    /// Listing filter rules
    #[serde(default)]
    pub filters: FilterRuleSet,

    /// Seen-id store location and retention
    #[serde(default)]
    pub store: StoreConfig,

    /// Stage chain and execution limits
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Notification channels and message format
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Listing sources
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::validation("http.timeout_secs must be > 0"));
        }
        if self.schedule.period_secs == 0 {
            return Err(AppError::validation("loop.period_secs must be > 0"));
        }
        QuietWindow::from_config(&self.schedule.pause)?;

        if self.pipeline.concurrency == 0 {
            return Err(AppError::validation("pipeline.concurrency must be > 0"));
        }
        if self.pipeline.fetch_timeout_secs == 0 {
            return Err(AppError::validation(
                "pipeline.fetch_timeout_secs must be > 0",
            ));
        }
        let specs = self.stage_specs()?;
        StageSpec::validate_order(&specs)?;
        self.pipeline.commit_guard.validate()?;

        if self.store.retention_days == Some(0) {
            return Err(AppError::validation("store.retention_days must be > 0"));
        }

        self.filters.validate()?;
        self.validate_notify()?;
        self.validate_sources()?;
        Ok(())
    }

    /// Parse the configured stage chain.
    pub fn stage_specs(&self) -> Result<Vec<StageSpec>> {
        self.pipeline
            .stages
            .iter()
            .map(|s| s.parse::<StageSpec>())
            .collect()
    }

    /// Sources that take part in polling.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Resolve the channel configuration for an enabled notifier name.
    ///
    /// Names without a `[notify.channels.<name>]` section resolve to a
    /// channel whose kind is the name itself (`console`).
    pub fn channel(&self, name: &str) -> ChannelConfig {
        self.notify
            .channels
            .get(name)
            .cloned()
            .unwrap_or_else(|| ChannelConfig {
                kind: Some(name.to_string()),
                url: None,
            })
    }

    fn validate_notify(&self) -> Result<()> {
        if self.notify.timeout_secs == 0 {
            return Err(AppError::validation("notify.timeout_secs must be > 0"));
        }
        for name in &self.notify.enabled {
            let channel = self.channel(name);
            if channel.kind_or(name) == "webhook" && channel.url.is_none() {
                return Err(AppError::validation(format!(
                    "notify.channels.{name}: webhook requires a url"
                )));
            }
        }
        if let Some(interval) = &self.notify.heartbeat {
            interval.parse::<HeartbeatInterval>()?;
        }
        Ok(())
    }

    fn validate_sources(&self) -> Result<()> {
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(AppError::validation("sources: name is empty"));
            }
            if !names.insert(source.name.as_str()) {
                return Err(AppError::validation(format!(
                    "sources: duplicate name '{}'",
                    source.name
                )));
            }
            if source.enabled && source.urls.is_empty() {
                return Err(AppError::validation(format!(
                    "sources.{}: no urls configured",
                    source.name
                )));
            }
            if source.kind == "html" && source.selectors.is_none() {
                return Err(AppError::validation(format!(
                    "sources.{}: html sources require [sources.selectors]",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is not set
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
        }
    }
}

/// Polling loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Keep polling instead of running a single cycle
    #[serde(default)]
    pub active: bool,

    /// Seconds between the start of two cycles
    #[serde(default = "defaults::period")]
    pub period_secs: u64,

    /// Time-of-day window without polling
    #[serde(default)]
    pub pause: PauseConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            active: false,
            period_secs: defaults::period(),
            pause: PauseConfig::default(),
        }
    }
}

/// Quiet window bounds as `HH:MM` local time. Equal bounds disable the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseConfig {
    #[serde(default = "defaults::midnight")]
    pub from: String,
    #[serde(default = "defaults::midnight")]
    pub till: String,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            from: defaults::midnight(),
            till: defaults::midnight(),
        }
    }
}

/// Seen-id store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the JSON Lines store file
    #[serde(default = "defaults::store_path")]
    pub path: PathBuf,

    /// Drop records older than this many days; keep forever when unset
    #[serde(default)]
    pub retention_days: Option<u32>,

    /// Which timestamp retention is measured from
    #[serde(default)]
    pub expire_by: ExpiryBasis,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: defaults::store_path(),
            retention_days: None,
            expire_by: ExpiryBasis::default(),
        }
    }
}

/// Stage chain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Ordered stage keys, e.g. `["dedup", "filter", "notify", "persist"]`
    #[serde(default = "defaults::stages")]
    pub stages: Vec<String>,

    /// Listings processed concurrently within one stage
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,

    /// Upper bound for one source fetch
    #[serde(default = "defaults::fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Upper bound for one enricher call
    #[serde(default = "defaults::enrich_timeout")]
    pub enrich_timeout_secs: u64,

    /// Escalation thresholds for failed commits
    #[serde(default)]
    pub commit_guard: CommitGuardConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: defaults::stages(),
            concurrency: defaults::concurrency(),
            fetch_timeout_secs: defaults::fetch_timeout(),
            enrich_timeout_secs: defaults::enrich_timeout(),
            commit_guard: CommitGuardConfig::default(),
        }
    }
}

/// Notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Names of the active notifiers
    #[serde(default)]
    pub enabled: Vec<String>,

    /// Message template, see [`crate::models::Listing::format`]
    #[serde(default = "defaults::message")]
    pub message: String,

    /// Upper bound for one notifier call
    #[serde(default = "defaults::notify_timeout")]
    pub timeout_secs: u64,

    /// `hour`, `day` or `week`
    #[serde(default)]
    pub heartbeat: Option<String>,

    /// Per-channel settings keyed by notifier name
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: Vec::new(),
            message: defaults::message(),
            timeout_secs: defaults::notify_timeout(),
            heartbeat: None,
            channels: BTreeMap::new(),
        }
    }
}

/// A single notification channel.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    /// Registry key of the notifier implementation; defaults to the channel name
    #[serde(default)]
    pub kind: Option<String>,

    /// Endpoint for webhook-style notifiers
    #[serde(default)]
    pub url: Option<String>,
}

impl ChannelConfig {
    pub fn kind_or<'a>(&'a self, name: &'a str) -> &'a str {
        self.kind.as_deref().unwrap_or(name)
    }
}

/// A listing source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique name, used as the dedup namespace
    pub name: String,

    /// Registry key of the source implementation (`html`, `json`, `file`)
    pub kind: String,

    /// Search URLs (or file paths for `file` sources)
    #[serde(default)]
    pub urls: Vec<String>,

    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// CSS selectors for `html` sources
    #[serde(default)]
    pub selectors: Option<SelectorConfig>,
}

/// CSS selectors describing one result page layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// One element per listing
    pub row: String,

    /// Title element, relative to the row
    pub title: String,

    /// Link element; the title element is used when absent
    #[serde(default)]
    pub link: Option<String>,

    /// Attribute holding the link target
    #[serde(default = "defaults::link_attr")]
    pub link_attr: String,

    /// Row attribute holding the listing id; derived from the link when absent
    #[serde(default)]
    pub id_attr: Option<String>,

    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub rooms: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

mod defaults {
    use std::path::PathBuf;

    pub fn log_level() -> String {
        "info".into()
    }

    // HTTP defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; flatwatch/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }

    // Loop defaults
    pub fn period() -> u64 {
        600
    }
    pub fn midnight() -> String {
        "00:00".into()
    }

    // Store defaults
    pub fn store_path() -> PathBuf {
        PathBuf::from("data/seen.jsonl")
    }

    // Pipeline defaults
    pub fn stages() -> Vec<String> {
        ["dedup", "filter", "price_per_square", "notify", "persist"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
    pub fn concurrency() -> usize {
        4
    }
    pub fn fetch_timeout() -> u64 {
        60
    }
    pub fn enrich_timeout() -> u64 {
        20
    }

    // Notify defaults
    pub fn message() -> String {
        "{title}\nRooms: {rooms}\nSize: {size}\nPrice: {price}\n\n{url}".into()
    }
    pub fn notify_timeout() -> u64 {
        30
    }

    // Source defaults
    pub fn enabled() -> bool {
        true
    }
    pub fn link_attr() -> String {
        "href".into()
    }
}
