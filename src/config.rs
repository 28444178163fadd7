// src/config.rs

//! Configuration loading utilities.
//!
//! Configuration is resolved in layers: the TOML file is the base, and each
//! override layer (currently the process environment) replaces only the keys
//! it defines. Layers are plain TOML tables merged key by key before the
//! result is deserialized into [`Config`].

use std::path::{Path, PathBuf};

use toml::{Table, Value};

use crate::error::{AppError, Result};
use crate::models::Config;

/// Prefix shared by all environment overrides.
pub const ENV_PREFIX: &str = "FLATWATCH_";

/// Supplies the configuration for the next cycle.
///
/// Called at the start of every cycle, so implementations re-read their
/// backing files to pick up edits without a restart.
pub trait ConfigLoader: Send + Sync {
    fn load(&self) -> Result<Config>;
}

/// Loads `config.toml` and layers environment overrides on top.
#[derive(Debug, Clone)]
pub struct FileConfigLoader {
    path: PathBuf,
    use_env: bool,
}

impl FileConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            use_env: true,
        }
    }

    /// Ignore the process environment (tests and the `--no-env` flag).
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigLoader for FileConfigLoader {
    fn load(&self) -> Result<Config> {
        let base = read_table(&self.path)?;
        let mut layers = vec![base];
        if self.use_env {
            layers.push(env_overrides(std::env::vars())?);
        }
        let config = resolve(layers)?;
        config.validate()?;
        Ok(config)
    }
}

/// A fixed configuration, used when the caller builds `Config` in code.
#[derive(Debug, Clone)]
pub struct StaticConfig(pub Config);

impl ConfigLoader for StaticConfig {
    fn load(&self) -> Result<Config> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}

/// Read a TOML file into a table.
pub fn read_table(path: &Path) -> Result<Table> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AppError::config(format!("Cannot read config file {}: {e}", path.display()))
    })?;
    Ok(content.parse::<Table>()?)
}

/// Merge layers in order and deserialize the result.
pub fn resolve(layers: impl IntoIterator<Item = Table>) -> Result<Config> {
    let mut merged = Table::new();
    for mut layer in layers {
        canonicalize(&mut layer);
        merge(&mut merged, layer);
    }
    Ok(Value::Table(merged).try_into::<Config>()?)
}

/// Alternate key spellings accepted in config files, as (section, alias, key).
const KEY_ALIASES: &[(&str, &str, &str)] =
    &[("filters", "excluded_titles", "excluded_title_patterns")];

/// Rename aliased keys so layers using different spellings merge into one key.
fn canonicalize(layer: &mut Table) {
    for (section, alias, key) in KEY_ALIASES {
        let Some(Value::Table(table)) = layer.get_mut(*section) else {
            continue;
        };
        if let Some(value) = table.remove(*alias) {
            // The canonical spelling wins within a single layer
            table.entry(key.to_string()).or_insert(value);
        }
    }
}

/// Merge `overlay` into `base`.
///
/// Nested tables are merged recursively; any other value in `overlay`
/// replaces the value in `base`. Keys absent from `overlay` are untouched.
pub fn merge(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => merge(existing, incoming),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Int,
    Float,
    Str,
    List(char),
    /// Loop period: also switches the loop on
    Period,
    /// Message template with `#CR#` line breaks
    Message,
    /// Presence switches to debug logging
    Verbose,
}

const OVERRIDES: &[(&str, &[&str], Kind)] = &[
    ("LOOP_PERIOD_SECONDS", &["loop", "period_secs"], Kind::Period),
    ("LOOP_PAUSE_FROM", &["loop", "pause", "from"], Kind::Str),
    ("LOOP_PAUSE_TILL", &["loop", "pause", "till"], Kind::Str),
    ("MESSAGE_FORMAT", &["notify", "message"], Kind::Message),
    ("NOTIFIERS", &["notify", "enabled"], Kind::List(',')),
    ("STORE_PATH", &["store", "path"], Kind::Str),
    ("STORE_RETENTION_DAYS", &["store", "retention_days"], Kind::Int),
    ("VERBOSE_LOG", &["logging", "level"], Kind::Verbose),
    (
        "FILTER_EXCLUDED_TITLES",
        &["filters", "excluded_title_patterns"],
        Kind::List(';'),
    ),
    ("FILTER_MIN_PRICE", &["filters", "min_price"], Kind::Float),
    ("FILTER_MAX_PRICE", &["filters", "max_price"], Kind::Float),
    ("FILTER_MIN_SIZE", &["filters", "min_size"], Kind::Float),
    ("FILTER_MAX_SIZE", &["filters", "max_size"], Kind::Float),
    ("FILTER_MIN_ROOMS", &["filters", "min_rooms"], Kind::Float),
    ("FILTER_MAX_ROOMS", &["filters", "max_rooms"], Kind::Float),
    (
        "FILTER_MAX_PRICE_PER_SQUARE",
        &["filters", "max_price_per_square"],
        Kind::Float,
    ),
];

/// Build the override layer from environment variables.
///
/// Takes the variables as an iterator so callers can pass a fixed set
/// instead of the process environment.
pub fn env_overrides<I, K, V>(vars: I) -> Result<Table>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut layer = Table::new();

    for (key, value) in vars {
        let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let Some((_, path, kind)) = OVERRIDES.iter().find(|(n, _, _)| *n == name) else {
            continue;
        };
        let raw = value.as_ref().trim();
        let var = key.as_ref();

        match kind {
            Kind::Period => {
                set_path(&mut layer, path, Value::Integer(parse_int(var, raw)?));
                set_path(&mut layer, &["loop", "active"], Value::Boolean(true));
            }
            _ => set_path(&mut layer, path, parse_value(var, raw, *kind)?),
        }
        log::debug!("Config override from {var}");
    }

    Ok(layer)
}

fn parse_value(var: &str, raw: &str, kind: Kind) -> Result<Value> {
    Ok(match kind {
        Kind::Int | Kind::Period => Value::Integer(parse_int(var, raw)?),
        Kind::Float => Value::Float(
            raw.parse::<f64>()
                .map_err(|e| AppError::config(format!("{var}: '{raw}' is not a number: {e}")))?,
        ),
        Kind::Str => Value::String(raw.to_string()),
        Kind::List(sep) => Value::Array(
            raw.split(sep)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        ),
        Kind::Message => Value::String(raw.split("#CR#").collect::<Vec<_>>().join("\n")),
        Kind::Verbose => Value::String("debug".to_string()),
    })
}

fn parse_int(var: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|e| AppError::config(format!("{var}: '{raw}' is not an integer: {e}")))
}

fn set_path(table: &mut Table, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = table;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert(Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        let Value::Table(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}
