//! Plugin registry.
//!
//! Sources and notifiers are chosen by the `kind` key of their configuration.
//! The built-in kinds are registered by [`PluginRegistry::with_defaults`];
//! applications add their own before handing the registry to the scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;

use crate::error::{AppError, Result};
use crate::models::{ChannelConfig, SourceConfig};
use crate::pipeline::{Enricher, StageSpec};
use crate::services::{
    ConsoleNotifier, FileSource, HtmlSource, JsonFeedSource, Notifier, Source, WebhookNotifier,
};

/// Builds a source from its configuration.
pub type SourceFactory = Box<dyn Fn(&SourceConfig, &Client) -> Result<Arc<dyn Source>> + Send + Sync>;

/// Builds a notifier from its channel name and configuration.
pub type NotifierFactory =
    Box<dyn Fn(&str, &ChannelConfig, &Client) -> Result<Arc<dyn Notifier>> + Send + Sync>;

pub struct PluginRegistry {
    sources: HashMap<String, SourceFactory>,
    notifiers: HashMap<String, NotifierFactory>,
    enrichers: HashMap<String, Arc<dyn Enricher>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PluginRegistry {
    /// A registry without any plugins.
    pub fn empty() -> Self {
        Self {
            sources: HashMap::new(),
            notifiers: HashMap::new(),
            enrichers: HashMap::new(),
        }
    }

    /// Registry with the `html`, `json` and `file` sources and the `console`
    /// and `webhook` notifiers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.register_source("html", |config, client| {
            let selectors = config.selectors.as_ref().ok_or_else(|| {
                AppError::config(format!("sources.{}: html sources require selectors", config.name))
            })?;
            Ok(Arc::new(HtmlSource::new(&config.name, client.clone(), selectors)?))
        });
        registry.register_source("json", |config, client| {
            Ok(Arc::new(JsonFeedSource::new(&config.name, client.clone())))
        });
        registry.register_source("file", |config, _| Ok(Arc::new(FileSource::new(&config.name))));

        registry.register_notifier("console", |name, _, _| Ok(Arc::new(ConsoleNotifier::new(name))));
        registry.register_notifier("webhook", |name, channel, client| {
            let url = channel.url.as_ref().ok_or_else(|| {
                AppError::config(format!("notify.channels.{name}: webhook requires a url"))
            })?;
            Ok(Arc::new(WebhookNotifier::new(name, url, client.clone())))
        });

        registry
    }

    pub fn register_source<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&SourceConfig, &Client) -> Result<Arc<dyn Source>> + Send + Sync + 'static,
    {
        self.sources.insert(kind.into(), Box::new(factory));
    }

    pub fn register_notifier<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&str, &ChannelConfig, &Client) -> Result<Arc<dyn Notifier>> + Send + Sync + 'static,
    {
        self.notifiers.insert(kind.into(), Box::new(factory));
    }

    /// Make an enricher available to `enrich:<name>` stages.
    pub fn register_enricher(&mut self, enricher: Arc<dyn Enricher>) {
        self.enrichers.insert(enricher.name().to_string(), enricher);
    }

    pub fn enrichers(&self) -> HashMap<String, Arc<dyn Enricher>> {
        self.enrichers.clone()
    }

    pub fn build_source(&self, config: &SourceConfig, client: &Client) -> Result<Arc<dyn Source>> {
        let factory = self.sources.get(&config.kind).ok_or_else(|| {
            AppError::config(format!(
                "sources.{}: unknown kind '{}'",
                config.name, config.kind
            ))
        })?;
        factory(config, client)
    }

    pub fn build_notifier(
        &self,
        name: &str,
        channel: &ChannelConfig,
        client: &Client,
    ) -> Result<Arc<dyn Notifier>> {
        let kind = channel.kind_or(name);
        let factory = self.notifiers.get(kind).ok_or_else(|| {
            AppError::config(format!("notify.channels.{name}: unknown kind '{kind}'"))
        })?;
        factory(name, channel, client)
    }

    pub fn has_source(&self, kind: &str) -> bool {
        self.sources.contains_key(kind)
    }

    pub fn has_notifier(&self, kind: &str) -> bool {
        self.notifiers.contains_key(kind)
    }

    pub fn has_enricher(&self, name: &str) -> bool {
        self.enrichers.contains_key(name)
    }

    /// Every `enrich:<name>` stage must name a registered enricher.
    pub fn check_stages(&self, specs: &[StageSpec]) -> Result<()> {
        for spec in specs {
            if let StageSpec::Enrich(name) = spec {
                if !self.has_enricher(name) {
                    return Err(AppError::config(format!(
                        "pipeline.stages: no enricher named '{name}'"
                    )));
                }
            }
        }
        Ok(())
    }
}
