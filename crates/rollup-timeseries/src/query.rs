//! Rollup Time Series Query
//!
//! Read path over the rollup tables. A query is a key-range scan per series
//! at one granularity; no aggregation happens at read time.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use rollup_common::{Granularity, Result};
use rollup_storage::RollupStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `(bucket_start, value)` pairs per series, ascending by bucket.
pub type SeriesData = BTreeMap<String, Vec<(i64, f64)>>;

// =============================================================================
// Range Query
// =============================================================================

/// A range query over several series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeQuery {
    #[serde(rename = "timeseries")]
    pub series: Vec<String>,
    /// Inclusive lower bound in epoch seconds.
    pub start: i64,
    /// Inclusive upper bound in epoch seconds.
    pub end: i64,
    pub granularity: Granularity,
}

impl RangeQuery {
    pub fn new(series: Vec<String>, start: i64, end: i64, granularity: Granularity) -> Self {
        Self {
            series,
            start,
            end,
            granularity,
        }
    }
}

// =============================================================================
// Query Service
// =============================================================================

/// Reads rollup tables on behalf of API callers.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn RollupStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn RollupStore>) -> Self {
        Self { store }
    }

    /// Every requested series maps to its buckets with
    /// `start <= bucket <= end`, possibly none.
    pub async fn query(&self, query: &RangeQuery) -> Result<SeriesData> {
        tracing::info!(
            "Querying {:?} [{}, {}] at {}",
            query.series,
            query.start,
            query.end,
            query.granularity
        );

        let mut data = SeriesData::new();
        for series in &query.series {
            let records = self
                .store
                .query_range(query.granularity, series, query.start, query.end)
                .await?;
            tracing::debug!("{} returned {} records", series, records.len());
            data.insert(
                series.clone(),
                records.into_iter().map(|r| (r.time, r.value)).collect(),
            );
        }
        Ok(data)
    }

    /// The most recent bucket of each requested series.
    pub async fn latest(&self, series: &[String], granularity: Granularity) -> Result<SeriesData> {
        let mut data = SeriesData::new();
        for name in series {
            let latest = self.store.query_latest(granularity, name).await?;
            data.insert(
                name.clone(),
                latest.into_iter().map(|r| (r.time, r.value)).collect(),
            );
        }
        Ok(data)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_common::AggregatedRecord;
    use rollup_storage::MemoryStore;

    async fn populated() -> QueryService {
        let store = Arc::new(MemoryStore::new());
        store
            .batch_write(
                Granularity::Hour,
                vec![
                    AggregatedRecord::new("a", 3600, 1.0, i64::MAX),
                    AggregatedRecord::new("a", 7200, 2.0, i64::MAX),
                    AggregatedRecord::new("a", 10800, 3.0, i64::MAX),
                    AggregatedRecord::new("b", 3600, 9.0, i64::MAX),
                ],
            )
            .await
            .expect("batch_write should succeed");
        QueryService::new(store)
    }

    #[tokio::test]
    async fn test_query_range_inclusive() {
        let service = populated().await;
        let query = RangeQuery::new(
            vec!["a".into(), "b".into(), "missing".into()],
            3600,
            7200,
            Granularity::Hour,
        );

        let data = service.query(&query).await.unwrap();
        assert_eq!(data["a"], vec![(3600, 1.0), (7200, 2.0)]);
        assert_eq!(data["b"], vec![(3600, 9.0)]);
        assert!(data["missing"].is_empty());
    }

    #[tokio::test]
    async fn test_latest() {
        let service = populated().await;
        let data = service
            .latest(&["a".into(), "missing".into()], Granularity::Hour)
            .await
            .unwrap();
        assert_eq!(data["a"], vec![(10800, 3.0)]);
        assert!(data["missing"].is_empty());
    }

    #[test]
    fn test_query_wire_format() {
        let query: RangeQuery = serde_json::from_str(
            r#"{"timeseries": ["a"], "start": 1, "end": 2, "granularity": "minute"}"#,
        )
        .unwrap();
        assert_eq!(query.granularity, Granularity::Minute);
        assert_eq!(query.series, vec!["a".to_string()]);
    }
}
