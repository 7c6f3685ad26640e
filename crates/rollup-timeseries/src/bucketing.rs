//! Rollup Time Series Bucketing
//!
//! Maps raw epoch seconds onto the canonical bucket of each granularity.
//! Minute and hour buckets are UTC-aligned. Day, month and year buckets
//! start at local midnight in the series timezone and are expressed back
//! in UTC epoch seconds.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rollup_common::{Granularity, Result, RollupError};

/// Largest daylight-saving gap searched when local midnight does not exist.
const MAX_GAP_MINUTES: i64 = 24 * 60;

// =============================================================================
// Bucket Interval
// =============================================================================

/// Half-open range of epoch seconds `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketInterval {
    pub start: i64,
    pub end: i64,
}

impl BucketInterval {
    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t < self.end
    }

    /// Last second inside the interval, for inclusive range scans.
    pub fn last_second(&self) -> i64 {
        self.end - 1
    }

    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

// =============================================================================
// Timezones
// =============================================================================

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| RollupError::InvalidTimezone(name.to_string()))
}

fn require_timezone(granularity: Granularity, tz: Option<&str>) -> Result<Tz> {
    match tz {
        Some(name) if !name.is_empty() => parse_timezone(name),
        _ => Err(RollupError::MissingTimezone(granularity)),
    }
}

fn local_date(t: i64, tz: &Tz) -> Result<NaiveDate> {
    DateTime::<Utc>::from_timestamp(t, 0)
        .map(|utc| utc.with_timezone(tz).date_naive())
        .ok_or_else(|| RollupError::Internal(format!("timestamp out of range: {}", t)))
}

/// First instant of `date` in `tz`. When midnight falls inside a
/// daylight-saving gap, the first valid minute after it is used.
fn local_midnight(date: NaiveDate, tz: &Tz) -> Result<i64> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| RollupError::Internal(format!("invalid date: {}", date)))?;

    for minutes in 0..=MAX_GAP_MINUTES {
        let candidate = midnight + chrono::Duration::minutes(minutes);
        if let Some(instant) = tz.from_local_datetime(&candidate).earliest() {
            return Ok(instant.timestamp());
        }
    }
    Err(RollupError::Internal(format!(
        "no valid local time on {} in {}",
        date, tz
    )))
}

fn period_start(granularity: Granularity, date: NaiveDate) -> Option<NaiveDate> {
    match granularity {
        Granularity::Month => date.with_day(1),
        Granularity::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        _ => Some(date),
    }
}

// =============================================================================
// Bucketing
// =============================================================================

/// Start of the bucket of `granularity` containing `t`.
pub fn bucket_start(granularity: Granularity, t: i64, tz: Option<&str>) -> Result<i64> {
    if !granularity.requires_timezone() {
        let width = granularity.fixed_seconds().ok_or_else(|| {
            RollupError::Internal(format!("{} has no fixed width", granularity))
        })?;
        return Ok(t - t.rem_euclid(width));
    }

    let tz = require_timezone(granularity, tz)?;
    let date = local_date(t, &tz)?;
    let first = period_start(granularity, date)
        .ok_or_else(|| RollupError::Internal(format!("invalid period start for {}", date)))?;
    local_midnight(first, &tz)
}

/// Bucket boundaries used to scan the next-finer table when recomputing an
/// average. Fixed-width granularities extend `unit` seconds from `t`;
/// month and year span from the period start to the next period start.
pub fn interval(granularity: Granularity, t: i64, tz: Option<&str>) -> Result<BucketInterval> {
    let tz = if granularity.requires_timezone() {
        Some(require_timezone(granularity, tz)?)
    } else {
        None
    };

    if let Some(width) = granularity.fixed_seconds() {
        return Ok(BucketInterval {
            start: t,
            end: t + width,
        });
    }

    let tz = tz.ok_or_else(|| RollupError::MissingTimezone(granularity))?;
    let date = local_date(t, &tz)?;
    let first = period_start(granularity, date)
        .ok_or_else(|| RollupError::Internal(format!("invalid period start for {}", date)))?;
    let step = match granularity {
        Granularity::Year => Months::new(12),
        _ => Months::new(1),
    };
    let next = first
        .checked_add_months(step)
        .ok_or_else(|| RollupError::Internal(format!("date overflow after {}", first)))?;

    Ok(BucketInterval {
        start: local_midnight(first, &tz)?,
        end: local_midnight(next, &tz)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
