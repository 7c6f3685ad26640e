//! Rollup Time Series Aggregation
//!
//! Aggregation methods a series can be rolled up with, and the pure value
//! helpers the engine uses to evaluate them.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use rollup_common::RollupError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Aggregation Method
// =============================================================================

/// How points of one series combine inside a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Sum,
    Count,
    Last,
    Max,
    Min,
    AbsMax,
    AbsMin,
    Average,
    #[serde(alias = "average_zero")]
    AverageWithoutZeroes,
}

impl AggregationMethod {
    pub const ALL: [AggregationMethod; 9] = [
        Self::Sum,
        Self::Count,
        Self::Last,
        Self::Max,
        Self::Min,
        Self::AbsMax,
        Self::AbsMin,
        Self::Average,
        Self::AverageWithoutZeroes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Last => "last",
            Self::Max => "max",
            Self::Min => "min",
            Self::AbsMax => "abs_max",
            Self::AbsMin => "abs_min",
            Self::Average => "average",
            Self::AverageWithoutZeroes => "average_without_zeroes",
        }
    }

    /// Whether `incoming` should replace `stored` for the absolute comparators.
    pub fn abs_prefers(&self, incoming: f64, stored: f64) -> bool {
        match self {
            Self::AbsMax => incoming.abs() > stored.abs(),
            Self::AbsMin => incoming.abs() < stored.abs(),
            _ => false,
        }
    }

    /// Reduce finer-granularity values into the recomputed aggregate.
    /// Returns `None` when nothing contributes.
    pub fn reduce(&self, values: &[f64]) -> Option<f64> {
        let contributing: Vec<f64> = match self {
            Self::AverageWithoutZeroes => values.iter().copied().filter(|v| *v != 0.0).collect(),
            _ => values.to_vec(),
        };
        mean(&contributing)
    }
}

impl Default for AggregationMethod {
    fn default() -> Self {
        Self::Sum
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationMethod {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "average_zero" {
            return Ok(Self::AverageWithoutZeroes);
        }
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RollupError::UnsupportedAggregation(s.to_string()))
    }
}

/// Arithmetic mean, or `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

// =============================================================================
// Tests
// =============================================================================
