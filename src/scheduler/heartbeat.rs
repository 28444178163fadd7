//! Periodic "still alive" notification.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatInterval {
    Hour,
    Day,
    Week,
}

impl HeartbeatInterval {
    pub fn period(&self) -> Duration {
        match self {
            HeartbeatInterval::Hour => Duration::hours(1),
            HeartbeatInterval::Day => Duration::days(1),
            HeartbeatInterval::Week => Duration::weeks(1),
        }
    }
}

impl FromStr for HeartbeatInterval {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hour" => Ok(HeartbeatInterval::Hour),
            "day" => Ok(HeartbeatInterval::Day),
            "week" => Ok(HeartbeatInterval::Week),
            other => Err(AppError::validation(format!(
                "notify.heartbeat: '{other}' is not one of hour, day, week"
            ))),
        }
    }
}

impl fmt::Display for HeartbeatInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeartbeatInterval::Hour => "hour",
            HeartbeatInterval::Day => "day",
            HeartbeatInterval::Week => "week",
        })
    }
}

/// Tracks when the last heartbeat went out.
#[derive(Debug, Clone, Default)]
pub struct Heartbeat {
    last: Option<DateTime<Utc>>,
}

impl Heartbeat {
    /// Due on the first check and then once per interval.
    pub fn is_due(&self, interval: HeartbeatInterval, now: DateTime<Utc>) -> bool {
        match self.last {
            None => true,
            Some(last) => now - last >= interval.period(),
        }
    }

    pub fn record(&mut self, now: DateTime<Utc>) {
        self.last = Some(now);
    }

    pub fn message(cycles: u64, sources: usize) -> String {
        format!(
            "flatwatch is still searching: {cycles} cycles so far, {sources} sources active."
        )
    }
}
