//! Listing processing chain.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s. Each cycle's listings run
//! through it once:
//!
//! ```text
//! dedup → filter → enrich… → notify → persist
//! ```
//!
//! Filtering stages drop listings, enrichers add annotations, `notify` fans
//! out to every notifier and `persist` marks the listing seen. Persist always
//! comes last, so a listing is only recorded after notification was attempted.

pub mod commit_guard;
pub mod dedup;
pub mod enrich;
pub mod filter;
pub mod notify;
pub mod persist;
#[allow(clippy::module_inception)]
pub mod pipeline;
pub mod stage;

pub use commit_guard::{CommitGuard, CommitGuardConfig};
pub use enrich::{Enricher, PricePerSquare};
pub use filter::{Filter, FilterRuleSet, Rejection, matches, parse_number};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineContext, PipelineReport};
pub use stage::{Annotations, Capability, Stage, StageSpec, Verdict};
