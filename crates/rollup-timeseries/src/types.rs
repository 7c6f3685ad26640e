//! Rollup Time Series Types
//!
//! Core data types for ingested time series points.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use serde::{Deserialize, Serialize};

// =============================================================================
// Time Series Point
// =============================================================================

/// A single point at one-second resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub series: String,
    /// Original, unbucketed timestamp in epoch seconds.
    pub timestamp: i64,
    pub value: f64,
    /// Value previously stored for the same second, when this point is a
    /// correction of an earlier delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<f64>,
}

impl TimeSeriesPoint {
    pub fn new(series: impl Into<String>, timestamp: i64, value: f64) -> Self {
        Self {
            series: series.into(),
            timestamp,
            value,
            old_value: None,
        }
    }

    pub fn with_old_value(mut self, old_value: f64) -> Self {
        self.old_value = Some(old_value);
        self
    }

    /// True when the point replaces a previously seen value.
    pub fn is_correction(&self) -> bool {
        self.old_value.is_some()
    }

    /// Net change this point brings to an additive aggregate.
    pub fn delta(&self) -> f64 {
        self.value - self.old_value.unwrap_or(0.0)
    }
}
