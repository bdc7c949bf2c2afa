//! Schedule descriptors
//!
//! Turns a schedule string into either a fixed interval or a cron
//! expression. Cron validity is only checked when the next fire time is
//! computed.

pub mod cron;

pub use cron::CronExpression;

use crate::error::{DaemonError, Result};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Minimum delay between cron fires, guards against clock skew busy loops
pub const MIN_CRON_DELAY: Duration = Duration::from_millis(1_000);

/// When a task should fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period in milliseconds
    Interval { ms: u64 },
    /// Five-field cron expression, evaluated in UTC
    Cron(CronExpression),
}

impl Schedule {
    pub fn is_cron(&self) -> bool {
        matches!(self, Schedule::Cron(_))
    }

    /// Delay from `now` until the next fire
    pub fn next_delay(&self, now: DateTime<Utc>) -> Result<Duration> {
        match self {
            Schedule::Interval { ms } => Ok(Duration::from_millis(*ms)),
            Schedule::Cron(expr) => {
                let next = expr.next_after(now)?;
                let delay = (next - now).to_std().unwrap_or_default();
                Ok(delay.max(MIN_CRON_DELAY))
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval { ms } => {
                if *ms >= DAY_MS && ms % DAY_MS == 0 {
                    write!(f, "every {}d", ms / DAY_MS)
                } else if *ms >= HOUR_MS && ms % HOUR_MS == 0 {
                    write!(f, "every {}h", ms / HOUR_MS)
                } else if *ms >= MINUTE_MS && ms % MINUTE_MS == 0 {
                    write!(f, "every {}m", ms / MINUTE_MS)
                } else if *ms >= SECOND_MS && ms % SECOND_MS == 0 {
                    write!(f, "every {}s", ms / SECOND_MS)
                } else {
                    write!(f, "every {}ms", ms)
                }
            }
            Schedule::Cron(expr) => write!(f, "cron '{}'", expr),
        }
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Parse a schedule string.
///
/// Accepted forms, checked in order:
/// - anything containing `*` or with five or more fields: cron
/// - `<n>s`, `<n>m`, `<n>h`, `<n>d`: interval
/// - a bare non-negative integer: interval in milliseconds
pub fn parse_schedule(input: &str) -> Result<Schedule> {
    let trimmed = input.trim();

    if trimmed.contains('*') || trimmed.split_whitespace().count() >= 5 {
        return Ok(Schedule::Cron(CronExpression::new(trimmed)));
    }

    if let Some(ms) = parse_interval(trimmed) {
        return Ok(Schedule::Interval { ms });
    }

    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(ms) = trimmed.parse::<u64>() {
            return Ok(Schedule::Interval { ms });
        }
    }

    Err(DaemonError::InvalidScheduleFormat(input.to_string()))
}

fn parse_interval(s: &str) -> Option<u64> {
    let unit = s.chars().last()?;
    let multiplier = match unit {
        's' => SECOND_MS,
        'm' => MINUTE_MS,
        'h' => HOUR_MS,
        'd' => DAY_MS,
        _ => return None,
    };
    let digits = &s[..s.len() - 1];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}
