//! Commit guard.
//!
//! A single failed `mark_seen` only means the listing is reconsidered next
//! cycle. When most commits of a cycle fail, the store itself is in trouble
//! (full disk, revoked permissions) and every listing will be notified again
//! on each cycle, so the cycle is escalated as failed.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Commit guard configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitGuardConfig {
    /// Maximum tolerated failure percentage (0-100). Default: 50%
    #[serde(default = "defaults::max_failure_percent")]
    pub max_failure_percent: u8,

    /// Failures below this count are never escalated.
    #[serde(default = "defaults::min_failures")]
    pub min_failures: usize,
}

impl Default for CommitGuardConfig {
    fn default() -> Self {
        Self {
            max_failure_percent: defaults::max_failure_percent(),
            min_failures: defaults::min_failures(),
        }
    }
}

impl CommitGuardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_failure_percent > 100 {
            return Err(AppError::validation(
                "pipeline.commit_guard.max_failure_percent must be <= 100",
            ));
        }
        Ok(())
    }
}

mod defaults {
    pub fn max_failure_percent() -> u8 {
        50
    }
    pub fn min_failures() -> usize {
        2
    }
}

/// Result of a commit guard check.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitGuardResult {
    /// Nothing was committed this cycle
    Idle,
    /// All commits succeeded
    Healthy { attempted: usize },
    /// Some commits failed, within tolerance
    Degraded {
        attempted: usize,
        failed: usize,
        failure_percent: f64,
    },
    /// Too many commits failed
    Triggered {
        attempted: usize,
        failed: usize,
        failure_percent: f64,
    },
}

/// Escalates cycles whose commit failure ratio is too high.
#[derive(Debug, Clone, Default)]
pub struct CommitGuard {
    config: CommitGuardConfig,
}

impl CommitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CommitGuardConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, attempted: usize, failed: usize) -> CommitGuardResult {
        if attempted == 0 {
            return CommitGuardResult::Idle;
        }
        if failed == 0 {
            return CommitGuardResult::Healthy { attempted };
        }

        let failure_percent = (failed as f64 / attempted as f64) * 100.0;
        if failed >= self.config.min_failures
            && failure_percent > self.config.max_failure_percent as f64
        {
            return CommitGuardResult::Triggered {
                attempted,
                failed,
                failure_percent,
            };
        }

        CommitGuardResult::Degraded {
            attempted,
            failed,
            failure_percent,
        }
    }

    /// Ok unless the guard triggers.
    pub fn validate(&self, attempted: usize, failed: usize) -> Result<()> {
        match self.check(attempted, failed) {
            CommitGuardResult::Idle => Ok(()),
            CommitGuardResult::Healthy { attempted } => {
                log::debug!("Commit guard: {} commits ok", attempted);
                Ok(())
            }
            CommitGuardResult::Degraded {
                attempted,
                failed,
                failure_percent,
            } => {
                log::warn!(
                    "Commit guard: {}/{} commits failed ({:.1}%), listings will be retried",
                    failed,
                    attempted,
                    failure_percent
                );
                Ok(())
            }
            CommitGuardResult::Triggered {
                attempted,
                failed,
                failure_percent,
            } => {
                log::error!(
                    "Commit guard: TRIGGERED! {}/{} commits failed ({:.1}% > {}% threshold)",
                    failed,
                    attempted,
                    failure_percent,
                    self.config.max_failure_percent
                );
                Err(AppError::CommitEscalation {
                    failed,
                    attempted,
                    failure_percent,
                    threshold_percent: self.config.max_failure_percent,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_and_healthy() {
        let guard = CommitGuard::new();
        assert_eq!(guard.check(0, 0), CommitGuardResult::Idle);
        assert_eq!(
            guard.check(10, 0),
            CommitGuardResult::Healthy { attempted: 10 }
        );
    }

    #[test]
    fn test_single_failure_is_tolerated() {
        let guard = CommitGuard::new();
        // 100% but below min_failures
        assert!(matches!(
            guard.check(1, 1),
            CommitGuardResult::Degraded { .. }
        ));
    }

    #[test]
    fn test_small_ratio_is_tolerated() {
        let guard = CommitGuard::new();
        assert!(matches!(
            guard.check(10, 3),
            CommitGuardResult::Degraded { .. }
        ));
    }

    #[test]
    fn test_all_failed_triggers() {
        let guard = CommitGuard::new();
        assert!(matches!(
            guard.check(4, 4),
            CommitGuardResult::Triggered { .. }
        ));

        let err = guard.validate(4, 4).unwrap_err();
        assert!(matches!(
            err,
            AppError::CommitEscalation {
                failed: 4,
                attempted: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_custom_threshold() {
        let guard = CommitGuard::with_config(CommitGuardConfig {
            max_failure_percent: 10,
            min_failures: 1,
        });
        assert!(guard.validate(10, 2).is_err());
        assert!(guard.validate(10, 1).is_ok());
    }
}
