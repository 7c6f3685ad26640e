//! Rollup Time Series Engine
//!
//! The aggregation engine folds one point into the bucket of a target
//! granularity. Each aggregation method maps onto a storage primitive with
//! its own consistency strategy; the engine itself holds no locks and relies
//! on the store's conditional writes for cross-worker correctness.
//!
//! | Method | Primitive |
//! |---|---|
//! | sum, count | atomic increment |
//! | last | conditional put on source time |
//! | max, min | conditional put on value |
//! | abs_max, abs_min | read, then unconditional put (racy) |
//! | average, average_without_zeroes | scan finer table, put mean |
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::aggregation::AggregationMethod;
use crate::bucketing::{bucket_start, interval};
use crate::policy::SeriesPolicy;
use crate::types::TimeSeriesPoint;
use rollup_common::{Granularity, RecordKey, Result, RollupError};
use rollup_storage::{RecordUpdate, RollupStore, UpdateCondition, UpdateOutcome};
use std::sync::Arc;

// =============================================================================
// Aggregation Outcome
// =============================================================================

/// What a single aggregation did to the stored bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOutcome {
    /// The value was written.
    Applied,
    /// A conditional check kept the stored value; only the TTL moved.
    Rejected,
    /// Nothing was written at all.
    Skipped,
}

impl From<UpdateOutcome> for AggregationOutcome {
    fn from(outcome: UpdateOutcome) -> Self {
        match outcome {
            UpdateOutcome::Applied => AggregationOutcome::Applied,
            UpdateOutcome::Rejected => AggregationOutcome::Rejected,
        }
    }
}

// =============================================================================
// Aggregation Engine
// =============================================================================

/// Applies points to rollup tables according to each series' policy.
#[derive(Clone)]
pub struct AggregationEngine {
    store: Arc<dyn RollupStore>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn RollupStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RollupStore> {
        &self.store
    }

    /// Fold `point` into its `target` bucket.
    pub async fn apply(
        &self,
        target: Granularity,
        point: &TimeSeriesPoint,
        policy: &SeriesPolicy,
    ) -> Result<AggregationOutcome> {
        let tz = Some(policy.timezone.as_str());
        let bucket = bucket_start(target, point.timestamp, tz)?;
        let ttl = policy.ttl(target, bucket)?;
        let key = RecordKey::new(point.series.clone(), bucket);
        let method = policy.aggregation;

        tracing::debug!(
            "Rolling up {} into {} {} with {} (value {}, old {:?})",
            point.series,
            target,
            bucket,
            method,
            point.value,
            point.old_value
        );

        let outcome = match method {
            AggregationMethod::Sum => {
                let update = RecordUpdate::Increment {
                    delta: point.delta(),
                    ttl,
                };
                self.store.update(target, &key, update).await?.into()
            }
            AggregationMethod::Count => {
                if point.is_correction() {
                    // A redelivered point is not counted again, only its TTL moves.
                    self.store.update(target, &key, RecordUpdate::RefreshTtl { ttl }).await?;
                    AggregationOutcome::Skipped
                } else {
                    let update = RecordUpdate::Increment { delta: 1.0, ttl };
                    self.store.update(target, &key, update).await?.into()
                }
            }
            AggregationMethod::Last => {
                self.put(target, &key, point.value, ttl, Some(point.timestamp), UpdateCondition::NewerSourceTime)
                    .await?
            }
            AggregationMethod::Max => {
                self.put(target, &key, point.value, ttl, None, UpdateCondition::ValueGreater)
                    .await?
            }
            AggregationMethod::Min => {
                self.put(target, &key, point.value, ttl, None, UpdateCondition::ValueLess)
                    .await?
            }
            AggregationMethod::AbsMax | AggregationMethod::AbsMin => {
                self.apply_absolute(method, target, &key, point.value, ttl).await?
            }
            AggregationMethod::Average | AggregationMethod::AverageWithoutZeroes => {
                self.recompute_average(method, target, &key, tz, ttl).await?
            }
        };

        tracing::debug!("{} {} -> {:?}", self.store.table_name(target), key, outcome);
        Ok(outcome)
    }

    async fn put(
        &self,
        target: Granularity,
        key: &RecordKey,
        value: f64,
        ttl: i64,
        last_source_time: Option<i64>,
        condition: UpdateCondition,
    ) -> Result<AggregationOutcome> {
        let update = RecordUpdate::Put {
            value,
            ttl,
            last_source_time,
            condition,
        };
        Ok(self.store.update(target, key, update).await?.into())
    }

    /// The store cannot compare absolute values, so the current value is read
    /// first. A concurrent writer between the read and the put can be lost.
    async fn apply_absolute(
        &self,
        method: AggregationMethod,
        target: Granularity,
        key: &RecordKey,
        value: f64,
        ttl: i64,
    ) -> Result<AggregationOutcome> {
        let current = self.store.get(target, key).await?;
        let replace = match &current {
            None => true,
            Some(record) => method.abs_prefers(value, record.value),
        };

        if replace {
            return self.put(target, key, value, ttl, None, UpdateCondition::Always).await;
        }

        self.store.update(target, key, RecordUpdate::RefreshTtl { ttl }).await?;
        Ok(AggregationOutcome::Rejected)
    }

    /// Recompute the bucket from the next-finer table.
    async fn recompute_average(
        &self,
        method: AggregationMethod,
        target: Granularity,
        key: &RecordKey,
        tz: Option<&str>,
        ttl: i64,
    ) -> Result<AggregationOutcome> {
        let finer = target
            .finer()
            .ok_or(RollupError::NoFinerGranularity(target))?;
        let range = interval(target, key.bucket, tz)?;

        let records = self
            .store
            .query_range(finer, &key.series, range.start, range.last_second())
            .await?;
        let values: Vec<f64> = records.iter().map(|r| r.value).collect();

        match method.reduce(&values) {
            Some(mean) => {
                self.put(target, key, mean, ttl, None, UpdateCondition::Always)
                    .await
            }
            None => {
                tracing::debug!("No data from {} for {}", finer, key);
                Ok(AggregationOutcome::Skipped)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::default_retentions;
    use rollup_common::AggregatedRecord;
    use rollup_storage::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, AggregationEngine) {
        let store = Arc::new(MemoryStore::new());
        let engine = AggregationEngine::new(store.clone());
        (store, engine)
    }

    fn policy(method: AggregationMethod) -> SeriesPolicy {
        SeriesPolicy::new("UTC", method, default_retentions())
    }

    async fn stored(store: &MemoryStore, g: Granularity, bucket: i64) -> Option<AggregatedRecord> {
        store
            .get(g, &RecordKey::new("meter", bucket))
            .await
            .expect("get should succeed")
    }

    const HOUR: i64 = 1513616400;

    #[tokio::test]
    async fn test_sum_is_order_independent() {
        let policy = policy(AggregationMethod::Sum);
        let a = TimeSeriesPoint::new("meter", HOUR + 10, 2.5);
        let b = TimeSeriesPoint::new("meter", HOUR + 70, 4.0);

        let (first, engine) = setup();
        engine.apply(Granularity::Hour, &a, &policy).await.unwrap();
        engine.apply(Granularity::Hour, &b, &policy).await.unwrap();

        let (second, engine) = setup();
        engine.apply(Granularity::Hour, &b, &policy).await.unwrap();
        engine.apply(Granularity::Hour, &a, &policy).await.unwrap();

        let x = stored(&first, Granularity::Hour, HOUR).await.unwrap();
        let y = stored(&second, Granularity::Hour, HOUR).await.unwrap();
        assert_eq!(x.value, 6.5);
        assert_eq!(x.value, y.value);
        assert_eq!(x.retention(), policy.retention(Granularity::Hour).unwrap());
    }

    #[tokio::test]
    async fn test_sum_correction_nets_out() {
        let (store, engine) = setup();
        let policy = policy(AggregationMethod::Sum);

        engine
            .apply(Granularity::Minute, &TimeSeriesPoint::new("meter", HOUR, 5.0), &policy)
            .await
            .unwrap();
        engine
            .apply(
                Granularity::Minute,
                &TimeSeriesPoint::new("meter", HOUR, 7.0).with_old_value(5.0),
                &policy,
            )
            .await
            .unwrap();

        assert_eq!(stored(&store, Granularity::Minute, HOUR).await.unwrap().value, 7.0);
    }

    #[tokio::test]
    async fn test_count_ignores_corrections() {
        let (store, engine) = setup();
        let policy = policy(AggregationMethod::Count);

        for t in [HOUR, HOUR + 1, HOUR + 2] {
            engine
                .apply(Granularity::Hour, &TimeSeriesPoint::new("meter", t, 9.0), &policy)
                .await
                .unwrap();
        }
        let outcome = engine
            .apply(
                Granularity::Hour,
                &TimeSeriesPoint::new("meter", HOUR, 3.0).with_old_value(9.0),
                &policy,
            )
            .await
            .unwrap();

        assert_eq!(outcome, AggregationOutcome::Skipped);
        assert_eq!(stored(&store, Granularity::Hour, HOUR).await.unwrap().value, 3.0);
    }

    /// Store a record for `meter` whose TTL has nearly run out.
    async fn stale(store: &MemoryStore, g: Granularity, value: f64, last_source_time: Option<i64>) {
        let mut record = AggregatedRecord::new("meter", HOUR, value, HOUR + 1);
        record.last_source_time = last_source_time;
        store.batch_write(g, vec![record]).await.unwrap();
    }

    #[tokio::test]
    async fn test_count_correction_refreshes_ttl() {
        let (store, engine) = setup();
        let policy = policy(AggregationMethod::Count);
        stale(&store, Granularity::Hour, 4.0, None).await;

        let outcome = engine
            .apply(
                Granularity::Hour,
                &TimeSeriesPoint::new("meter", HOUR, 3.0).with_old_value(9.0),
                &policy,
            )
            .await
            .unwrap();

        assert_eq!(outcome, AggregationOutcome::Skipped);
        let record = stored(&store, Granularity::Hour, HOUR).await.unwrap();
        assert_eq!(record.value, 4.0);
        assert_eq!(record.ttl, policy.ttl(Granularity::Hour, HOUR).unwrap());
    }

    #[tokio::test]
    async fn test_rejected_last_refreshes_ttl() {
        let (store, engine) = setup();
        let policy = policy(AggregationMethod::Last);
        stale(&store, Granularity::Minute, 1.0, Some(HOUR + 30)).await;

        let older = TimeSeriesPoint::new("meter", HOUR + 10, 99.0);
        let outcome = engine.apply(Granularity::Minute, &older, &policy).await.unwrap();

        assert_eq!(outcome, AggregationOutcome::Rejected);
        let record = stored(&store, Granularity::Minute, HOUR).await.unwrap();
        assert_eq!(record.value, 1.0);
        assert_eq!(record.last_source_time, Some(HOUR + 30));
        assert_eq!(record.ttl, policy.ttl(Granularity::Minute, HOUR).unwrap());
        assert!(record.ttl > HOUR + 1);
    }

    #[tokio::test]
    async fn test_rejected_absolute_refreshes_ttl() {
        let (store, engine) = setup();
        let abs_max = policy(AggregationMethod::AbsMax);
        stale(&store, Granularity::Hour, -8.0, None).await;

        let outcome = engine
            .apply(Granularity::Hour, &TimeSeriesPoint::new("meter", HOUR + 5, 5.0), &abs_max)
            .await
            .unwrap();

        assert_eq!(outcome, AggregationOutcome::Rejected);
        let record = stored(&store, Granularity::Hour, HOUR).await.unwrap();
        assert_eq!(record.value, -8.0);
        assert_eq!(record.ttl, abs_max.ttl(Granularity::Hour, HOUR).unwrap());

        let abs_min = policy(AggregationMethod::AbsMin);
        stale(&store, Granularity::Minute, 0.5, None).await;
        let outcome = engine
            .apply(Granularity::Minute, &TimeSeriesPoint::new("meter", HOUR, -2.0), &abs_min)
            .await
            .unwrap();

        assert_eq!(outcome, AggregationOutcome::Rejected);
        let record = stored(&store, Granularity::Minute, HOUR).await.unwrap();
        assert_eq!(record.value, 0.5);
        assert_eq!(record.ttl, abs_min.ttl(Granularity::Minute, HOUR).unwrap());
    }

    #[tokio::test]
    async fn test_last_resolves_out_of_order_delivery() {
        let (store, engine) = setup();
        let policy = policy(AggregationMethod::Last);

        let newer = TimeSeriesPoint::new("meter", HOUR + 30, 1.0);
        let older = TimeSeriesPoint::new("meter", HOUR + 10, 99.0);

        engine.apply(Granularity::Minute, &newer, &policy).await.unwrap();
        let outcome = engine.apply(Granularity::Minute, &older, &policy).await.unwrap();
        assert_eq!(outcome, AggregationOutcome::Rejected);

        let record = stored(&store, Granularity::Minute, HOUR).await.unwrap();
        assert_eq!(record.value, 1.0);
        assert_eq!(record.last_source_time, Some(HOUR + 30));
    }

    #[tokio::test]
    async fn test_max_and_min() {
        let (store, engine) = setup();
        let max = policy(AggregationMethod::Max);
        let min = policy(AggregationMethod::Min);

        for value in [3.0, 8.0, -2.0] {
            let point = TimeSeriesPoint::new("meter", HOUR, value);
            engine.apply(Granularity::Minute, &point, &max).await.unwrap();
            engine.apply(Granularity::Hour, &point, &min).await.unwrap();
        }

        assert_eq!(stored(&store, Granularity::Minute, HOUR).await.unwrap().value, 8.0);
        assert_eq!(stored(&store, Granularity::Hour, HOUR).await.unwrap().value, -2.0);
    }

    #[tokio::test]
    async fn test_absolute_comparators() {
        let (store, engine) = setup();
        let abs_max = policy(AggregationMethod::AbsMax);

        for value in [3.0, -8.0, 5.0] {
            engine
                .apply(Granularity::Minute, &TimeSeriesPoint::new("meter", HOUR, value), &abs_max)
                .await
                .unwrap();
        }
        assert_eq!(stored(&store, Granularity::Minute, HOUR).await.unwrap().value, -8.0);

        let abs_min = policy(AggregationMethod::AbsMin);
        for value in [-4.0, 1.5, -3.0] {
            engine
                .apply(Granularity::Hour, &TimeSeriesPoint::new("meter", HOUR, value), &abs_min)
                .await
                .unwrap();
        }
        assert_eq!(stored(&store, Granularity::Hour, HOUR).await.unwrap().value, 1.5);
    }

    #[tokio::test]
    async fn test_average_without_zeroes() {
        let (store, engine) = setup();
        let finer: Vec<_> = [0.0, 100.0, 20.0, 30.0, 0.0, 10.0]
            .iter()
            .enumerate()
            .map(|(i, v)| AggregatedRecord::new("meter", HOUR + i as i64 * 60, *v, i64::MAX))
            .collect();
        store.batch_write(Granularity::Minute, finer).await.unwrap();
        // Next hour, must not contribute.
        store
            .batch_write(
                Granularity::Minute,
                vec![AggregatedRecord::new("meter", HOUR + 3600, 1000.0, i64::MAX)],
            )
            .await
            .unwrap();

        let policy = policy(AggregationMethod::AverageWithoutZeroes);
        let outcome = engine
            .apply(Granularity::Hour, &TimeSeriesPoint::new("meter", HOUR + 5, 0.0), &policy)
            .await
            .unwrap();

        assert_eq!(outcome, AggregationOutcome::Applied);
        assert_eq!(stored(&store, Granularity::Hour, HOUR).await.unwrap().value, 40.0);
    }

    #[tokio::test]
    async fn test_average_without_finer_data_writes_nothing() {
        let (store, engine) = setup();
        let policy = policy(AggregationMethod::Average);
        let outcome = engine
            .apply(Granularity::Day, &TimeSeriesPoint::new("meter", HOUR, 5.0), &policy)
            .await
            .unwrap();

        assert_eq!(outcome, AggregationOutcome::Skipped);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_average_on_finest_fails() {
        let (_, engine) = setup();
        let result = engine
            .apply(
                Granularity::Second,
                &TimeSeriesPoint::new("meter", HOUR, 1.0),
                &policy(AggregationMethod::Average),
            )
            .await;
        assert!(matches!(result, Err(RollupError::NoFinerGranularity(_))));
    }

    #[tokio::test]
    async fn test_missing_timezone_is_configuration_error() {
        let (_, engine) = setup();
        let mut policy = policy(AggregationMethod::Sum);
        policy.timezone = String::new();

        let err = engine
            .apply(Granularity::Month, &TimeSeriesPoint::new("meter", HOUR, 1.0), &policy)
            .await
            .unwrap_err();
        assert!(err.is_configuration_error());
    }
}
