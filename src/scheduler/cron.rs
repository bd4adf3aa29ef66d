//! Five-field cron expressions (`minute hour day-of-month month day-of-week`)
//! evaluated in UTC.
//!
//! Each field accepts `*`, single values, `a-b` ranges, `/n` steps on either
//! and comma-separated lists. Day-of-week runs 0-6 from Sunday; 7 is also
//! Sunday. When both day fields are restricted a day matches if either does.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CronError {
    #[error("Expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("Invalid {field} field: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Upper bound on the search. Covers every leap-day schedule.
const SEARCH_YEARS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    restricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1 << value) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount(parts.len()));
        }

        let mut days_of_week = parse_field(parts[4], "day-of-week", 0, 7)?;
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes: parse_field(parts[0], "minute", 0, 59)?,
            hours: parse_field(parts[1], "hour", 0, 23)?,
            days_of_month: parse_field(parts[2], "day-of-month", 1, 31)?,
            months: parse_field(parts[3], "month", 1, 12)?,
            days_of_week,
        })
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = after.year() + SEARCH_YEARS;

        while t.year() <= limit {
            if !self.months.contains(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0).single()? + Duration::days(1);
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(t.day());
        let dow = self.days_of_week.contains(t.weekday().num_days_from_sunday());
        match (self.days_of_month.restricted, self.days_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

fn parse_field(raw: &str, name: &'static str, min: u32, max: u32) -> Result<Field, CronError> {
    let invalid = || CronError::InvalidField {
        field: name,
        value: raw.to_string(),
    };
    let number = |s: &str| -> Result<u32, CronError> {
        let value: u32 = s.parse().map_err(|_| invalid())?;
        if value < min || value > max {
            return Err(invalid());
        }
        Ok(value)
    };

    let mut bits = 0u64;
    let mut restricted = false;
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (number(a)?, number(b)?);
            if a > b {
                return Err(invalid());
            }
            (a, b)
        } else {
            let a = number(range)?;
            // `a/n` runs from a to the end of the field
            (a, if step > 1 { max } else { a })
        };

        if range != "*" || step > 1 {
            restricted = true;
        }
        for value in (start..=end).step_by(step as usize) {
            bits |= 1 << value;
        }
    }

    Ok(Field { bits, restricted })
}
