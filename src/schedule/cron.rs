//! Minimal five-field cron evaluator (UTC)
//!
//! Supports `*`, lists (`1,15`), ranges (`9-17`) and steps (`*/5`,
//! `0-30/10`). Day-of-week accepts 0-7 with both 0 and 7 meaning Sunday.

use crate::error::{DaemonError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use std::fmt;

/// How far ahead `next_after` searches before giving up
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// Unvalidated cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    raw: String,
}

#[derive(Debug, Clone, Copy)]
struct FieldSet {
    bits: u64,
    /// Field was `*` (or `*/1`)
    any: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct CronFields {
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronFields {
    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(t.day());
        let dow = self.days_of_week.contains(t.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted either may match
        if !self.days_of_month.any && !self.days_of_week.any {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl CronExpression {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check the expression without computing a fire time
    pub fn validate(&self) -> Result<()> {
        self.fields().map(|_| ())
    }

    /// First fire time strictly after `after`, at minute resolution
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let fields = self.fields()?;
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .ok_or_else(|| self.error("cannot truncate start time"))?;
        let mut t = start + Duration::minutes(1);
        let horizon = after + Duration::days(SEARCH_HORIZON_DAYS);

        while t <= horizon {
            if !fields.months.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc
                    .with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single()
                    .ok_or_else(|| self.error("date arithmetic overflow"))?;
                continue;
            }
            if !fields.day_matches(&t) {
                let next_day = t.date_naive() + Duration::days(1);
                t = next_day.and_time(NaiveTime::MIN).and_utc();
                continue;
            }
            if !fields.hours.contains(t.hour()) {
                t = t - Duration::minutes(i64::from(t.minute())) + Duration::hours(1);
                continue;
            }
            if !fields.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Ok(t);
        }

        Err(self.error("no matching time within five years"))
    }

    fn fields(&self) -> Result<CronFields> {
        let parts: Vec<&str> = self.raw.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(self.error(&format!("expected 5 fields, found {}", parts.len())));
        }

        let mut days_of_week = self.parse_field(parts[4], 0, 7, "day-of-week")?;
        if days_of_week.contains(7) {
            days_of_week.bits |= 1;
            days_of_week.bits &= !(1u64 << 7);
        }

        Ok(CronFields {
            minutes: self.parse_field(parts[0], 0, 59, "minute")?,
            hours: self.parse_field(parts[1], 0, 23, "hour")?,
            days_of_month: self.parse_field(parts[2], 1, 31, "day-of-month")?,
            months: self.parse_field(parts[3], 1, 12, "month")?,
            days_of_week,
        })
    }

    fn parse_field(&self, field: &str, min: u32, max: u32, name: &str) -> Result<FieldSet> {
        let mut set = FieldSet { bits: 0, any: false };

        for item in field.split(',') {
            let (base, step) = match item.split_once('/') {
                Some((base, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| self.error(&format!("invalid {} step '{}'", name, step)))?;
                    if step == 0 {
                        return Err(self.error(&format!("{} step cannot be zero", name)));
                    }
                    (base, step)
                }
                None => (item, 1),
            };

            let (lo, hi) = if base == "*" {
                if step == 1 {
                    set.any = true;
                }
                (min, max)
            } else if let Some((lo, hi)) = base.split_once('-') {
                (self.parse_value(lo, min, max, name)?, self.parse_value(hi, min, max, name)?)
            } else {
                let value = self.parse_value(base, min, max, name)?;
                // `5/10` means "from 5 to the end, every 10"
                (value, if step > 1 { max } else { value })
            };

            if lo > hi {
                return Err(self.error(&format!("{} range {}-{} is reversed", name, lo, hi)));
            }

            let mut v = lo;
            while v <= hi {
                set.bits |= 1u64 << v;
                v += step;
            }
        }

        Ok(set)
    }

    fn parse_value(&self, s: &str, min: u32, max: u32, name: &str) -> Result<u32> {
        let value: u32 = s
            .parse()
            .map_err(|_| self.error(&format!("invalid {} value '{}'", name, s)))?;
        if value < min || value > max {
            return Err(self.error(&format!(
                "{} {} out of range {}-{}",
                name, value, min, max
            )));
        }
        Ok(value)
    }

    fn error(&self, reason: &str) -> DaemonError {
        DaemonError::InvalidCron {
            expr: self.raw.clone(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
