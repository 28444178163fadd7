//! Stage trait and stage descriptors.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::Listing;

/// Annotations a stage asks the pipeline to add to a listing.
pub type Annotations = Vec<(String, String)>;

/// What a stage does; used to check chain ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Drops listings already in the id store
    Dedup,
    Filter,
    Enrich,
    Notify,
    Persist,
}

/// Outcome of one stage for one listing.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Pass the listing on, adding the given annotations
    Keep(Annotations),
    /// Remove the listing from the rest of the chain
    Drop(String),
}

impl Verdict {
    pub fn keep() -> Self {
        Verdict::Keep(Vec::new())
    }

    pub fn drop(reason: impl Into<String>) -> Self {
        Verdict::Drop(reason.into())
    }
}

/// One step of the processing chain.
///
/// Stages see listings read-only. Any change to a listing goes through the
/// annotations of a [`Verdict::Keep`], which the pipeline applies.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    async fn process(&self, listing: &Listing) -> Result<Verdict>;

    /// Called once after every listing of a run went through the stage.
    async fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Configured stage key, e.g. `dedup` or `enrich:geocode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSpec {
    Dedup,
    Filter,
    PricePerSquare,
    Enrich(String),
    Notify,
    Persist,
}

impl StageSpec {
    pub fn capability(&self) -> Capability {
        match self {
            StageSpec::Dedup => Capability::Dedup,
            StageSpec::Filter => Capability::Filter,
            StageSpec::PricePerSquare | StageSpec::Enrich(_) => Capability::Enrich,
            StageSpec::Notify => Capability::Notify,
            StageSpec::Persist => Capability::Persist,
        }
    }

    /// Reject chains that lose listings or notify them more than once.
    pub fn validate_order(specs: &[StageSpec]) -> Result<()> {
        let stages: Vec<(String, Capability)> = specs
            .iter()
            .map(|s| (s.to_string(), s.capability()))
            .collect();
        check_order(&stages)
    }
}

/// Ordering rules for a chain:
///
/// - persist appears at most once, as the last stage, after a notify stage;
/// - a notify stage needs a dedup stage before it and a persist stage.
///
/// Chains with neither notify nor persist (dry runs) are accepted.
pub(crate) fn check_order(stages: &[(String, Capability)]) -> Result<()> {
    let position = |capability: Capability| stages.iter().position(|(_, c)| *c == capability);

    let persist: Vec<usize> = stages
        .iter()
        .enumerate()
        .filter(|(_, (_, cap))| *cap == Capability::Persist)
        .map(|(i, _)| i)
        .collect();

    if persist.len() > 1 {
        return Err(AppError::validation(
            "pipeline.stages: more than one persist stage",
        ));
    }
    if let Some(&pos) = persist.first() {
        if let Some((name, _)) = stages[pos + 1..].first() {
            return Err(AppError::validation(format!(
                "pipeline.stages: '{name}' runs after persist; persist must be last"
            )));
        }
    }

    let notify = position(Capability::Notify);
    match (notify, persist.first()) {
        (None, Some(_)) => {
            return Err(AppError::validation(
                "pipeline.stages: persist without a notify stage marks listings seen unannounced",
            ));
        }
        (Some(_), None) => {
            return Err(AppError::validation(
                "pipeline.stages: notify without persist announces listings on every cycle",
            ));
        }
        _ => {}
    }

    if let Some(notify) = notify {
        match position(Capability::Dedup) {
            Some(dedup) if dedup < notify => {}
            _ => {
                return Err(AppError::validation(
                    "pipeline.stages: notify needs a dedup stage before it",
                ));
            }
        }
    }
    Ok(())
}

impl FromStr for StageSpec {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim();
        match key {
            "dedup" => Ok(StageSpec::Dedup),
            "filter" => Ok(StageSpec::Filter),
            "price_per_square" => Ok(StageSpec::PricePerSquare),
            "notify" => Ok(StageSpec::Notify),
            "persist" => Ok(StageSpec::Persist),
            _ => match key.strip_prefix("enrich:") {
                Some(name) if !name.trim().is_empty() => {
                    Ok(StageSpec::Enrich(name.trim().to_string()))
                }
                _ => Err(AppError::validation(format!(
                    "pipeline.stages: unknown stage '{key}'"
                ))),
            },
        }
    }
}

impl fmt::Display for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageSpec::Dedup => f.write_str("dedup"),
            StageSpec::Filter => f.write_str("filter"),
            StageSpec::PricePerSquare => f.write_str("price_per_square"),
            StageSpec::Enrich(name) => write!(f, "enrich:{name}"),
            StageSpec::Notify => f.write_str("notify"),
            StageSpec::Persist => f.write_str("persist"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(keys: &[&str]) -> Vec<StageSpec> {
        keys.iter().map(|k| k.parse().unwrap()).collect()
    }

    #[test]
    fn test_parse_stage_keys() {
        assert_eq!("dedup".parse::<StageSpec>().unwrap(), StageSpec::Dedup);
        assert_eq!(
            "enrich:geocode".parse::<StageSpec>().unwrap(),
            StageSpec::Enrich("geocode".into())
        );
        assert!("enrich:".parse::<StageSpec>().is_err());
        assert!("teleport".parse::<StageSpec>().is_err());
    }

    #[test]
    fn test_default_order_is_valid() {
        let chain = specs(&["dedup", "filter", "price_per_square", "notify", "persist"]);
        assert!(StageSpec::validate_order(&chain).is_ok());
    }

    #[test]
    fn test_persist_must_be_last() {
        let chain = specs(&["dedup", "persist", "notify"]);
        assert!(StageSpec::validate_order(&chain).is_err());

        let chain = specs(&["dedup", "persist", "filter"]);
        assert!(StageSpec::validate_order(&chain).is_err());
    }

    #[test]
    fn test_single_persist() {
        let chain = specs(&["dedup", "notify", "persist", "persist"]);
        assert!(StageSpec::validate_order(&chain).is_err());
    }

    #[test]
    fn test_persist_needs_notify_before_it() {
        let chain = specs(&["dedup", "filter", "persist"]);
        assert!(StageSpec::validate_order(&chain).is_err());
    }

    #[test]
    fn test_notify_needs_dedup_before_it() {
        let chain = specs(&["notify", "persist"]);
        assert!(StageSpec::validate_order(&chain).is_err());

        let chain = specs(&["filter", "notify", "dedup", "persist"]);
        assert!(StageSpec::validate_order(&chain).is_err());
    }

    #[test]
    fn test_notify_needs_persist() {
        let chain = specs(&["dedup", "notify"]);
        assert!(StageSpec::validate_order(&chain).is_err());
    }

    #[test]
    fn test_dry_run_chain_is_valid() {
        let chain = specs(&["dedup", "filter", "price_per_square"]);
        assert!(StageSpec::validate_order(&chain).is_ok());
    }
}
