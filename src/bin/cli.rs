//! flatwatch CLI
//!
//! Local execution entry point.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use flatwatch::{
    config::{ConfigLoader, FileConfigLoader},
    error::{AppError, Result},
    models::Config,
    scheduler::PollScheduler,
    services::PluginRegistry,
    storage::{IdStore, LocalIdStore},
};

/// flatwatch - new listing notifier
#[derive(Parser, Debug)]
#[command(
    name = "flatwatch",
    version,
    about = "Polls listing sites and notifies about new listings exactly once"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Ignore FLATWATCH_* environment overrides
    #[arg(long)]
    no_env: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll sources, looping when `loop.active` is set
    Run {
        /// Run a single cycle even if the loop is active
        #[arg(long)]
        once: bool,
    },

    /// Validate the configuration
    Validate,

    /// Remove seen ids older than the retention period
    Prune {
        /// Retention in days (default: store.retention_days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show store statistics
    Info,
}

/// Forces single-cycle mode on top of another loader.
struct SingleRun<L>(L);

impl<L: ConfigLoader> ConfigLoader for SingleRun<L> {
    fn load(&self) -> Result<Config> {
        let mut config = self.0.load()?;
        config.schedule.active = false;
        Ok(config)
    }
}

/// Initialize logging based on verbosity flag and configured level.
fn init_logging(verbose: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = if cli.no_env {
        FileConfigLoader::new(&cli.config).without_env()
    } else {
        FileConfigLoader::new(&cli.config)
    };
    let loaded = loader.load();
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(cli.verbose, &level);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            log::error!("Cannot load {}: {}", cli.config.display(), e);
            return Err(e);
        }
    };
    log::info!("Loaded configuration from {}", loader.path().display());

    match cli.command {
        Command::Run { once } => {
            let store: Arc<dyn IdStore> =
                Arc::new(LocalIdStore::open(&config.store.path, config.store.expire_by).await?);
            let registry = PluginRegistry::with_defaults();

            let mut scheduler = if once {
                PollScheduler::new(SingleRun(loader), registry, store)
            } else {
                PollScheduler::new(loader, registry, store)
            };

            let shutdown = scheduler.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("Ctrl-C received, finishing current work...");
                    shutdown.trigger();
                }
            });

            scheduler.run().await?;
            log::info!("Stopped after {} cycles", scheduler.cycles());
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            // Loading already validated; report what the configuration resolves to
            let stages = config.stage_specs()?;
            log::info!(
                "✓ Config OK: {} sources ({} enabled), {} notifiers, stages: {}",
                config.sources.len(),
                config.enabled_sources().count(),
                config.notify.enabled.len(),
                stages
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(" → ")
            );

            let registry = PluginRegistry::with_defaults();
            for source in config.enabled_sources() {
                if !registry.has_source(&source.kind) {
                    return Err(AppError::validation(format!(
                        "sources.{}: unknown kind '{}'",
                        source.name, source.kind
                    )));
                }
            }
            for name in &config.notify.enabled {
                let channel = config.channel(name);
                if !registry.has_notifier(channel.kind_or(name)) {
                    return Err(AppError::validation(format!(
                        "notify.channels.{name}: unknown kind '{}'",
                        channel.kind_or(name)
                    )));
                }
            }
            registry.check_stages(&stages)?;
            log::info!("All validations passed!");
        }

        Command::Prune { days } => {
            let Some(days) = days.or(config.store.retention_days) else {
                return Err(AppError::config(
                    "No retention period: pass --days or set store.retention_days",
                ));
            };
            let store = LocalIdStore::open(&config.store.path, config.store.expire_by).await?;
            let before = Utc::now() - Duration::days(i64::from(days));
            let removed = store.prune(before).await?;
            log::info!(
                "Removed {} records older than {} days ({:?})",
                removed,
                days,
                config.store.expire_by
            );
        }

        Command::Info => {
            let store = LocalIdStore::open(&config.store.path, config.store.expire_by).await?;
            let stats = store.stats().await?;
            log::info!("Store: {}", store.path().display());
            log::info!("Seen listings: {}", stats.records);
            if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
                log::info!("First seen between {} and {}", oldest, newest);
            }
            match config.store.retention_days {
                Some(days) => log::info!(
                    "Retention: {} days by {:?}",
                    days,
                    config.store.expire_by
                ),
                None => log::info!("Retention: keep forever"),
            }
        }
    }

    Ok(())
}
