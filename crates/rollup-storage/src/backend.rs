//! Rollup Backend - Storage Layer Abstraction
//!
//! Defines the storage interface the rollup pipeline writes through. One
//! logical table exists per granularity, keyed by series and bucket start.
//! Consistency between concurrent writers to the same key is delegated to
//! the conditional update primitives exposed here; callers never lock.
//!
//! Key Features:
//! - Atomic increment, conditional put and TTL refresh primitives
//! - Inclusive range and latest-bucket queries per series
//! - Batch writes that report throttled items as unprocessed
//! - TTL expiry hook for backends without native expiry
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use async_trait::async_trait;
use rollup_common::{AggregatedRecord, Granularity, RecordKey, Result};

// =============================================================================
// Update Primitives
// =============================================================================

/// Predicate a conditional put must satisfy against the stored record.
/// A missing record satisfies every condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCondition {
    Always,
    /// Incoming value is strictly greater than the stored value.
    ValueGreater,
    /// Incoming value is strictly less than the stored value.
    ValueLess,
    /// Stored source time is absent or strictly older than the incoming one.
    NewerSourceTime,
}

/// A single-key mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpdate {
    /// `value = coalesce(value, 0) + delta`, unconditionally.
    Increment { delta: f64, ttl: i64 },
    /// Replace the value if `condition` holds. The TTL is refreshed either way.
    Put {
        value: f64,
        ttl: i64,
        last_source_time: Option<i64>,
        condition: UpdateCondition,
    },
    /// Touch the TTL of an existing record without changing its value.
    RefreshTtl { ttl: i64 },
}

impl RecordUpdate {
    pub fn ttl(&self) -> i64 {
        match self {
            RecordUpdate::Increment { ttl, .. }
            | RecordUpdate::Put { ttl, .. }
            | RecordUpdate::RefreshTtl { ttl } => *ttl,
        }
    }
}

/// Result of a single-key mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The value was written.
    Applied,
    /// The condition failed or there was nothing to refresh.
    Rejected,
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

/// Result of a batch write.
#[derive(Debug, Clone, Default)]
pub struct BatchWriteOutcome {
    pub written: usize,
    /// Items the backend did not accept this time, to be resubmitted.
    pub unprocessed: Vec<AggregatedRecord>,
}

impl BatchWriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.unprocessed.is_empty()
    }
}

// =============================================================================
// Rollup Store Trait
// =============================================================================

/// Storage interface for the per-granularity rollup tables.
#[async_trait]
pub trait RollupStore: Send + Sync {
    /// Physical table name backing a granularity.
    fn table_name(&self, granularity: Granularity) -> String;

    /// Fetch a single record.
    async fn get(&self, granularity: Granularity, key: &RecordKey)
        -> Result<Option<AggregatedRecord>>;

    /// Records of one series with `start <= time <= end`, ascending.
    async fn query_range(
        &self,
        granularity: Granularity,
        series: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<AggregatedRecord>>;

    /// The most recent record of one series.
    async fn query_latest(
        &self,
        granularity: Granularity,
        series: &str,
    ) -> Result<Option<AggregatedRecord>>;

    /// Apply a single-key mutation.
    async fn update(
        &self,
        granularity: Granularity,
        key: &RecordKey,
        update: RecordUpdate,
    ) -> Result<UpdateOutcome>;

    /// Unconditionally put a batch of records.
    async fn batch_write(
        &self,
        granularity: Granularity,
        records: Vec<AggregatedRecord>,
    ) -> Result<BatchWriteOutcome>;

    /// Remove every record whose TTL has elapsed at `now`.
    async fn purge_expired(&self, now: i64) -> Result<usize>;

    /// Get storage statistics.
    fn stats(&self) -> StorageStats;
}

// =============================================================================
// Storage Statistics
// =============================================================================

/// Counters about storage usage and operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub total_records: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub rejected_updates: u64,
    pub unprocessed_items: u64,
    pub throttled_updates: u64,
    pub expired_records: u64,
}
