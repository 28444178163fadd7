//! Time-of-day quiet window.

use chrono::{Duration, NaiveDateTime, NaiveTime};

use crate::error::{AppError, Result};
use crate::models::PauseConfig;

/// Daily window without polling, e.g. `23:00..07:00`.
///
/// The window may wrap midnight. Equal bounds mean there is no window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    from: NaiveTime,
    till: NaiveTime,
}

impl QuietWindow {
    pub fn new(from: NaiveTime, till: NaiveTime) -> Self {
        Self { from, till }
    }

    pub fn from_config(config: &PauseConfig) -> Result<Self> {
        Ok(Self::new(
            parse_time("loop.pause.from", &config.from)?,
            parse_time("loop.pause.till", &config.till)?,
        ))
    }

    pub fn is_enabled(&self) -> bool {
        self.from != self.till
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if self.from < self.till {
            self.from <= time && time < self.till
        } else {
            time >= self.from || time < self.till
        }
    }

    /// Time left until the window ends, or `None` outside the window.
    pub fn until_end(&self, now: NaiveDateTime) -> Option<Duration> {
        if !self.contains(now.time()) {
            return None;
        }
        let today_end = now.date().and_time(self.till);
        let end = if today_end > now {
            today_end
        } else {
            today_end + Duration::days(1)
        };
        Some(end - now)
    }
}

fn parse_time(key: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| AppError::validation(format!("{key}: '{value}' is not HH:MM")))
}
