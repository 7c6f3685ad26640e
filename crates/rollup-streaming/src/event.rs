//! Rollup Streaming Events
//!
//! Wire format of the records carried by the derived-event stream. A direct
//! event targets the finest table and carries a ready-to-store record; a
//! rollup event targets a coarser table and embeds the policy of its series
//! so consumers never consult the policy directory.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use bytes::Bytes;
use rollup_common::{AggregatedRecord, Granularity, Result, RollupError};
use rollup_timeseries::{SeriesPolicy, TimeSeriesPoint};
use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// Event Data
// =============================================================================

/// The point carried by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub timeserie: String,
    #[serde(deserialize_with = "int_or_string")]
    pub time: i64,
    #[serde(deserialize_with = "number_or_string")]
    pub value: f64,
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default, deserialize_with = "optional_number_or_string")]
    pub old_value: Option<f64>,
}

impl EventData {
    pub fn from_point(point: &TimeSeriesPoint, ttl: Option<i64>) -> Self {
        Self {
            timeserie: point.series.clone(),
            time: point.timestamp,
            value: point.value,
            ttl,
            old_value: point.old_value,
        }
    }

    pub fn to_point(&self) -> TimeSeriesPoint {
        TimeSeriesPoint {
            series: self.timeserie.clone(),
            timestamp: self.time,
            value: self.value,
            old_value: self.old_value,
        }
    }
}

// Producers that read numbers back from a string-keyed store emit them as
// strings, so both encodings are accepted.
#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Numeric {
    fn as_f64(&self) -> std::result::Result<f64, String> {
        match self {
            Numeric::Int(v) => Ok(*v as f64),
            Numeric::Float(v) => Ok(*v),
            Numeric::Text(s) => s.trim().parse().map_err(|_| format!("not a number: {}", s)),
        }
    }

    fn as_i64(&self) -> std::result::Result<i64, String> {
        match self {
            Numeric::Int(v) => Ok(*v),
            Numeric::Float(v) if v.fract() == 0.0 => Ok(*v as i64),
            Numeric::Float(v) => Err(format!("not an integer: {}", v)),
            Numeric::Text(s) => s.trim().parse().map_err(|_| format!("not an integer: {}", s)),
        }
    }
}

fn int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    Numeric::deserialize(deserializer)?
        .as_i64()
        .map_err(serde::de::Error::custom)
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    Numeric::deserialize(deserializer)?
        .as_f64()
        .map_err(serde::de::Error::custom)
}

fn optional_number_or_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<f64>, D::Error> {
    Option::<Numeric>::deserialize(deserializer)?
        .map(|n| n.as_f64())
        .transpose()
        .map_err(serde::de::Error::custom)
}

// =============================================================================
// Derived Event
// =============================================================================

/// One record on the derived-event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedEvent {
    pub granularity: Granularity,
    pub data: EventData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<SeriesPolicy>,
}

impl DerivedEvent {
    /// Event writing a point straight into the finest table.
    pub fn direct(point: &TimeSeriesPoint, ttl: i64) -> Self {
        Self {
            granularity: Granularity::FINEST,
            data: EventData::from_point(point, Some(ttl)),
            aggregation: None,
        }
    }

    /// Event rolling a point up into `target`.
    pub fn rollup(target: Granularity, point: &TimeSeriesPoint, policy: &SeriesPolicy) -> Self {
        Self {
            granularity: target,
            data: EventData::from_point(point, None),
            aggregation: Some(policy.clone()),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.granularity.is_finest()
    }

    /// Transport partition key; events of one granularity share a partition.
    pub fn partition_key(&self) -> &'static str {
        self.granularity.as_str()
    }

    pub fn point(&self) -> TimeSeriesPoint {
        self.data.to_point()
    }

    /// Record to store for a direct event.
    pub fn record(&self) -> Result<AggregatedRecord> {
        let ttl = self
            .data
            .ttl
            .ok_or_else(|| RollupError::MissingField("data.ttl".into()))?;
        Ok(AggregatedRecord::new(
            self.data.timeserie.clone(),
            self.data.time,
            self.data.value,
            ttl,
        ))
    }

    /// Policy embedded in a rollup event.
    pub fn policy(&self) -> Result<&SeriesPolicy> {
        self.aggregation
            .as_ref()
            .ok_or_else(|| RollupError::MissingField("aggregation".into()))
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| RollupError::Serialization(e.to_string()))
    }

    /// Decode and check that the fields required by the event kind exist.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let event: DerivedEvent =
            serde_json::from_slice(data).map_err(|e| RollupError::MalformedEvent(e.to_string()))?;
        if event.data.timeserie.is_empty() {
            return Err(RollupError::MissingField("data.timeserie".into()));
        }
        if event.is_direct() {
            event.record()?;
        } else {
            event.policy()?;
        }
        Ok(event)
    }
}

// =============================================================================
// Tests
// =============================================================================
