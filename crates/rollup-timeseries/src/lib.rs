//! Rollup Time Series - Bucketing and Aggregation
//!
//! Time-series logic of the rollup pipeline: mapping timestamps onto
//! granularity buckets, per-series policies, the aggregation engine that
//! folds points into rollup tables, and the query service reading them.
//!
//! Key Features:
//! - UTC and timezone-aware calendar bucketing
//! - Nine aggregation methods with distinct consistency strategies
//! - Policy directory with default-policy creation
//! - Inclusive range and latest-value queries
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod aggregation;
pub mod bucketing;
pub mod engine;
pub mod policy;
pub mod query;
pub mod types;

pub use aggregation::AggregationMethod;
pub use bucketing::{bucket_start, interval, BucketInterval};
pub use engine::{AggregationEngine, AggregationOutcome};
pub use policy::{
    MemoryPolicyDirectory, PolicyDirectory, PolicyResolver, Retentions, SeriesPolicy,
    AGGREGATION_SEPARATOR, DEFAULT_TIMEZONE,
};
pub use query::{QueryService, RangeQuery, SeriesData};
pub use types::TimeSeriesPoint;
