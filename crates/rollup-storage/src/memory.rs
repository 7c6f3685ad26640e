//! Rollup Memory - In-Memory Rollup Store
//!
//! In-memory implementation of [`RollupStore`] for tests, development and
//! the standalone pipeline binary. Emulates the behaviour of a provisioned
//! key-value store: conditional writes, partial batch acceptance under a
//! write capacity, TTL expiry and a change feed on one captured table.
//!
//! Key Features:
//! - Per-granularity tables partitioned by series, sorted by bucket
//! - Conditional updates evaluated under the table write lock
//! - Optional write capacity that leaves excess batch items unprocessed
//! - Optional update capacity that throttles single-key updates
//! - Change capture broadcast for the finest table
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::backend::{
    BatchWriteOutcome, RecordUpdate, RollupStore, StorageStats, UpdateCondition, UpdateOutcome,
};
use crate::changes::ChangeRecord;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rollup_common::{AggregatedRecord, Granularity, RecordKey, Result, RollupError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::broadcast;

const DEFAULT_CHANGE_CAPACITY: usize = 65_536;

type Table = HashMap<String, BTreeMap<i64, AggregatedRecord>>;

// =============================================================================
// Change Capture
// =============================================================================

struct ChangeCapture {
    granularity: Granularity,
    sender: broadcast::Sender<ChangeRecord>,
}

// =============================================================================
// Update Capacity
// =============================================================================

/// Token bucket of single-key update units, refilled continuously at
/// `per_second` units per second up to a burst of `per_second`.
struct UpdateCapacity {
    per_second: f64,
    available: f64,
    refilled_at: Instant,
}

impl UpdateCapacity {
    fn new(per_second: usize) -> Self {
        let per_second = per_second.max(1) as f64;
        Self {
            per_second,
            available: per_second,
            refilled_at: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.available = (self.available + elapsed * self.per_second).min(self.per_second);
        self.refilled_at = now;

        if self.available >= 1.0 {
            self.available -= 1.0;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory rollup store.
pub struct MemoryStore {
    table_prefix: Option<String>,
    tables: Vec<RwLock<Table>>,
    write_capacity: Option<usize>,
    update_capacity: Option<Mutex<UpdateCapacity>>,
    capture: Option<ChangeCapture>,
    pending_failures: AtomicU64,
    stats: RwLock<StorageStats>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            table_prefix: None,
            tables: Granularity::ALL.iter().map(|_| RwLock::new(Table::new())).collect(),
            write_capacity: None,
            update_capacity: None,
            capture: None,
            pending_failures: AtomicU64::new(0),
            stats: RwLock::new(StorageStats::default()),
        }
    }

    pub fn with_table_prefix(mut self, prefix: Option<String>) -> Self {
        self.table_prefix = prefix.filter(|p| !p.is_empty());
        self
    }

    /// Accept at most `items` records per batch write.
    pub fn with_write_capacity(mut self, items: usize) -> Self {
        self.write_capacity = Some(items.max(1));
        self
    }

    /// Accept at most `units` single-key updates per second. Updates beyond
    /// the capacity fail with [`RollupError::Throttled`].
    pub fn with_update_capacity(mut self, units: usize) -> Self {
        self.update_capacity = Some(Mutex::new(UpdateCapacity::new(units)));
        self
    }

    /// Publish a change record for every effective write to `granularity`.
    pub fn with_change_capture(self, granularity: Granularity) -> Self {
        self.with_change_capture_capacity(granularity, DEFAULT_CHANGE_CAPACITY)
    }

    pub fn with_change_capture_capacity(mut self, granularity: Granularity, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        self.capture = Some(ChangeCapture {
            granularity,
            sender,
        });
        self
    }

    /// Subscribe to the change feed, if capture is enabled.
    pub fn subscribe_changes(&self) -> Option<broadcast::Receiver<ChangeRecord>> {
        self.capture.as_ref().map(|c| c.sender.subscribe())
    }

    /// Make the next `count` single-key updates fail with a storage error.
    pub fn fail_next_updates(&self, count: u64) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of records stored at a granularity.
    pub fn len(&self, granularity: Granularity) -> usize {
        self.table(granularity).read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        Granularity::ALL.iter().all(|g| self.len(*g) == 0)
    }

    fn table(&self, granularity: Granularity) -> &RwLock<Table> {
        &self.tables[granularity.index()]
    }

    fn take_injected_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn consume_update_unit(&self) -> bool {
        self.update_capacity
            .as_ref()
            .map_or(true, |capacity| capacity.lock().try_consume())
    }

    fn publish(&self, granularity: Granularity, old: Option<&AggregatedRecord>, new: &AggregatedRecord) {
        let Some(capture) = self.capture.as_ref() else {
            return;
        };
        if capture.granularity != granularity {
            return;
        }
        let table = self.table_name(granularity);
        if let Some(change) = ChangeRecord::from_write(&table, granularity, old, new) {
            // No subscriber is not an error: the feed is best effort.
            let _ = capture.sender.send(change);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Update Evaluation
// =============================================================================

fn condition_holds(
    condition: UpdateCondition,
    existing: &AggregatedRecord,
    value: f64,
    last_source_time: Option<i64>,
) -> bool {
    match condition {
        UpdateCondition::Always => true,
        UpdateCondition::ValueGreater => value > existing.value,
        UpdateCondition::ValueLess => value < existing.value,
        UpdateCondition::NewerSourceTime => match (existing.last_source_time, last_source_time) {
            (Some(stored), Some(incoming)) => stored < incoming,
            _ => true,
        },
    }
}

/// Compute the image to store for `update`, or `None` when nothing is written.
/// A rejected put still yields an image carrying the refreshed TTL.
fn apply_update(
    key: &RecordKey,
    existing: Option<&AggregatedRecord>,
    update: &RecordUpdate,
) -> (Option<AggregatedRecord>, UpdateOutcome) {
    match (update, existing) {
        (RecordUpdate::Increment { delta, ttl }, Some(record)) => {
            let mut next = record.clone();
            next.value += delta;
            next.ttl = *ttl;
            (Some(next), UpdateOutcome::Applied)
        }
        (RecordUpdate::Increment { delta, ttl }, None) => (
            Some(AggregatedRecord::new(key.series.clone(), key.bucket, *delta, *ttl)),
            UpdateOutcome::Applied,
        ),
        (
            RecordUpdate::Put {
                value,
                ttl,
                last_source_time,
                condition,
            },
            existing,
        ) => match existing {
            Some(record) if !condition_holds(*condition, record, *value, *last_source_time) => {
                let mut next = record.clone();
                next.ttl = *ttl;
                (Some(next), UpdateOutcome::Rejected)
            }
            _ => {
                let mut next = AggregatedRecord::new(key.series.clone(), key.bucket, *value, *ttl);
                next.last_source_time = *last_source_time;
                (Some(next), UpdateOutcome::Applied)
            }
        },
        (RecordUpdate::RefreshTtl { ttl }, Some(record)) => {
            let mut next = record.clone();
            next.ttl = *ttl;
            (Some(next), UpdateOutcome::Applied)
        }
        (RecordUpdate::RefreshTtl { .. }, None) => (None, UpdateOutcome::Rejected),
    }
}

// =============================================================================
// Rollup Store Implementation
// =============================================================================

#[async_trait]
impl RollupStore for MemoryStore {
    fn table_name(&self, granularity: Granularity) -> String {
        granularity.table_name(self.table_prefix.as_deref())
    }

    async fn get(
        &self,
        granularity: Granularity,
        key: &RecordKey,
    ) -> Result<Option<AggregatedRecord>> {
        let record = self
            .table(granularity)
            .read()
            .get(&key.series)
            .and_then(|rows| rows.get(&key.bucket))
            .cloned();
        self.stats.write().read_ops += 1;
        Ok(record)
    }

    async fn query_range(
        &self,
        granularity: Granularity,
        series: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<AggregatedRecord>> {
        self.stats.write().read_ops += 1;
        if start > end {
            return Ok(Vec::new());
        }
        let records = self
            .table(granularity)
            .read()
            .get(series)
            .map(|rows| rows.range(start..=end).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default();
        Ok(records)
    }

    async fn query_latest(
        &self,
        granularity: Granularity,
        series: &str,
    ) -> Result<Option<AggregatedRecord>> {
        self.stats.write().read_ops += 1;
        let record = self
            .table(granularity)
            .read()
            .get(series)
            .and_then(|rows| rows.last_key_value())
            .map(|(_, r)| r.clone());
        Ok(record)
    }

    async fn update(
        &self,
        granularity: Granularity,
        key: &RecordKey,
        update: RecordUpdate,
    ) -> Result<UpdateOutcome> {
        if self.take_injected_failure() {
            return Err(RollupError::Storage(format!(
                "injected failure updating {} in {}",
                key,
                self.table_name(granularity)
            )));
        }
        if !self.consume_update_unit() {
            self.stats.write().throttled_updates += 1;
            return Err(RollupError::Throttled(self.table_name(granularity)));
        }

        let mut table = self.table(granularity).write();
        let rows = table.entry(key.series.clone()).or_default();
        let existing = rows.get(&key.bucket);
        let is_new = existing.is_none();
        let (next, outcome) = apply_update(key, existing, &update);

        if let Some(next) = next {
            self.publish(granularity, existing, &next);
            rows.insert(key.bucket, next);
        }
        if rows.is_empty() {
            table.remove(&key.series);
        }
        drop(table);

        let mut stats = self.stats.write();
        stats.write_ops += 1;
        if is_new && outcome.is_applied() {
            stats.total_records += 1;
        }
        if !outcome.is_applied() {
            stats.rejected_updates += 1;
        }
        tracing::trace!(
            "{} {} -> {:?}",
            self.table_name(granularity),
            key,
            outcome
        );
        Ok(outcome)
    }

    async fn batch_write(
        &self,
        granularity: Granularity,
        mut records: Vec<AggregatedRecord>,
    ) -> Result<BatchWriteOutcome> {
        let accepted = self.write_capacity.unwrap_or(records.len()).min(records.len());
        let unprocessed = records.split_off(accepted);

        let mut inserted = 0;
        {
            let mut table = self.table(granularity).write();
            for record in records {
                let rows = table.entry(record.series.clone()).or_default();
                let previous = rows.get(&record.time);
                self.publish(granularity, previous, &record);
                if rows.insert(record.time, record).is_none() {
                    inserted += 1;
                }
            }
        }

        let mut stats = self.stats.write();
        stats.write_ops += accepted as u64;
        stats.total_records += inserted;
        stats.unprocessed_items += unprocessed.len() as u64;

        Ok(BatchWriteOutcome {
            written: accepted,
            unprocessed,
        })
    }

    async fn purge_expired(&self, now: i64) -> Result<usize> {
        let mut purged = 0;
        for table in &self.tables {
            let mut table = table.write();
            for rows in table.values_mut() {
                let before = rows.len();
                rows.retain(|_, record| !record.is_expired(now));
                purged += before - rows.len();
            }
            table.retain(|_, rows| !rows.is_empty());
        }

        if purged > 0 {
            let mut stats = self.stats.write();
            stats.expired_records += purged as u64;
            stats.total_records = stats.total_records.saturating_sub(purged as u64);
            tracing::debug!("Purged {} expired records", purged);
        }
        Ok(purged)
    }

    fn stats(&self) -> StorageStats {
        self.stats.read().clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
