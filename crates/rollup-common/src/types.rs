//! Rollup Types - Core Data Types
//!
//! Fundamental data types shared by the storage, aggregation and streaming
//! layers: the granularity ladder, record keys and the stored rollup record.
//!
//! Key Features:
//! - Totally ordered granularities from second to year
//! - Per-granularity table naming with optional prefix
//! - Aggregated record with TTL and source-time tie-break
//! - Serialization support via serde
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::error::RollupError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SECONDS_IN_MINUTE: i64 = 60;
pub const SECONDS_IN_HOUR: i64 = SECONDS_IN_MINUTE * 60;
pub const SECONDS_IN_DAY: i64 = SECONDS_IN_HOUR * 24;

// =============================================================================
// Granularity
// =============================================================================

/// Bucket width of a rollup table, ordered from finest to coarsest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl Granularity {
    /// Every granularity, finest first.
    pub const ALL: [Granularity; 6] = [
        Granularity::Second,
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Month,
        Granularity::Year,
    ];

    /// The granularity raw points are written at.
    pub const FINEST: Granularity = Granularity::Second;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Position on the ladder, 0 for second.
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn is_finest(&self) -> bool {
        *self == Self::FINEST
    }

    /// The immediately finer granularity, if any.
    pub fn finer(&self) -> Option<Granularity> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// The immediately coarser granularity, if any.
    pub fn coarser(&self) -> Option<Granularity> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Granularities that receive derived rollup events, walking up the
    /// ladder from the one just above the finest.
    pub fn rollup_targets() -> impl Iterator<Item = Granularity> {
        std::iter::successors(Self::FINEST.coarser(), Granularity::coarser)
    }

    /// Width in seconds for granularities that do not depend on the calendar.
    pub fn fixed_seconds(&self) -> Option<i64> {
        match self {
            Self::Second => Some(1),
            Self::Minute => Some(SECONDS_IN_MINUTE),
            Self::Hour => Some(SECONDS_IN_HOUR),
            Self::Day => Some(SECONDS_IN_DAY),
            Self::Month | Self::Year => None,
        }
    }

    /// Whether bucketing needs the series timezone.
    pub fn requires_timezone(&self) -> bool {
        matches!(self, Self::Day | Self::Month | Self::Year)
    }

    /// Storage table holding this granularity, e.g. `prod_timeseries_hour`.
    pub fn table_name(&self, prefix: Option<&str>) -> String {
        match prefix {
            Some(prefix) if !prefix.is_empty() => {
                format!("{}_timeseries_{}", prefix, self.as_str())
            }
            _ => format!("timeseries_{}", self.as_str()),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| RollupError::UnknownGranularity(s.to_string()))
    }
}

// =============================================================================
// Record Key
// =============================================================================

/// Primary key of a rollup record: partition key plus bucket sort key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub series: String,
    pub bucket: i64,
}

impl RecordKey {
    pub fn new(series: impl Into<String>, bucket: i64) -> Self {
        Self {
            series: series.into(),
            bucket,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.series, self.bucket)
    }
}

// =============================================================================
// Aggregated Record
// =============================================================================

/// One stored row per `(series, granularity, bucket)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    #[serde(rename = "timeserie")]
    pub series: String,
    /// Bucket start in epoch seconds.
    pub time: i64,
    pub value: f64,
    /// Epoch second after which the storage layer may expire the row.
    pub ttl: i64,
    /// Original timestamp of the point behind `value`, only kept by `last`.
    #[serde(rename = "last_time", default, skip_serializing_if = "Option::is_none")]
    pub last_source_time: Option<i64>,
}

impl AggregatedRecord {
    pub fn new(series: impl Into<String>, time: i64, value: f64, ttl: i64) -> Self {
        Self {
            series: series.into(),
            time,
            value,
            ttl,
            last_source_time: None,
        }
    }

    pub fn with_last_source_time(mut self, source_time: i64) -> Self {
        self.last_source_time = Some(source_time);
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.series.clone(), self.time)
    }

    /// Seconds of retention the record was written with.
    pub fn retention(&self) -> i64 {
        self.ttl - self.time
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.ttl <= now
    }
}

// =============================================================================
// Tests
// =============================================================================
