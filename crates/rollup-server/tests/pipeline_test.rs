//! End-to-end tests for the rollup pipeline
//!
//! Drives raw points through ingestion, the finest table, change capture,
//! fanout, the shard workers and the aggregation engine, then reads the
//! result back through the query service.

use rollup_common::{DefaultPolicyMode, Granularity, RecordKey, RollupConfig};
use rollup_server::Pipeline;
use rollup_storage::RollupStore;
use rollup_streaming::parse_batch;
use rollup_timeseries::{RangeQuery, SeriesData};
use std::future::Future;
use std::time::Duration;

const HOUR_RETENTION: i64 = 186 * 86400;

async fn started_pipeline() -> Pipeline {
    let config = RollupConfig::default()
        .with_default_policy(DefaultPolicyMode::Create)
        .with_sleep_interval(Duration::from_millis(5));
    let mut pipeline = Pipeline::new(config).unwrap();
    pipeline.start().await.unwrap();
    pipeline
}

/// Poll `check` until it returns `Some`, failing after a few seconds.
async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn query(pipeline: &Pipeline, series: &str, start: i64, end: i64, g: Granularity) -> SeriesData {
    pipeline
        .query(&RangeQuery::new(vec![series.to_string()], start, end, g))
        .await
        .unwrap()
}

async fn value_at(pipeline: &Pipeline, g: Granularity, series: &str, bucket: i64) -> Option<f64> {
    pipeline
        .store()
        .get(g, &RecordKey::new(series, bucket))
        .await
        .unwrap()
        .map(|record| record.value)
}

#[tokio::test]
async fn test_hourly_sum_rollup() {
    let pipeline = started_pipeline().await;
    let batch = parse_batch(r#"{"meter": [[1513616400, 1], [1513616460, 1], [1513620000, 1]]}"#).unwrap();
    assert_eq!(pipeline.ingest(&batch).await.unwrap(), 3);

    let expected = vec![(1513616400, 2.0), (1513620000, 1.0)];
    eventually("hourly sums", || async {
        let data = query(&pipeline, "meter", 1513616400, 1513620000, Granularity::Hour).await;
        (data["meter"] == expected).then_some(())
    })
    .await;

    for bucket in [1513616400, 1513620000] {
        let record = pipeline
            .store()
            .get(Granularity::Hour, &RecordKey::new("meter", bucket))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.ttl - record.time, HOUR_RETENTION);
    }

    let seconds = query(&pipeline, "meter", 1513616400, 1513620000, Granularity::Second).await;
    assert_eq!(seconds["meter"].len(), 3);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_every_granularity_is_rolled_up() {
    let pipeline = started_pipeline().await;
    let batch = parse_batch(r#"{"energy": [[1513616400, 2.5]]}"#).unwrap();
    pipeline.ingest(&batch).await.unwrap();

    for g in Granularity::rollup_targets() {
        eventually("rollup at every granularity", || async {
            let latest = pipeline.latest(&["energy".to_string()], g).await.unwrap();
            (latest["energy"].len() == 1 && latest["energy"][0].1 == 2.5).then_some(())
        })
        .await;
    }

    let report = pipeline.shutdown().await.unwrap();
    assert_eq!(report.pump.changes, 1);
    assert_eq!(report.pump.published, 5);
}

#[tokio::test]
async fn test_average_without_zeroes() {
    let pipeline = started_pipeline().await;
    pipeline
        .policies()
        .update_policy("temperature", "UTC", "average_without_zeroes", None)
        .await
        .unwrap();

    let batch = parse_batch(
        r#"{"temperature": [[1513616400, 0], [1513616401, 100], [1513616402, 20],
                            [1513616403, 30], [1513616404, 0], [1513616405, 10]]}"#,
    )
    .unwrap();
    pipeline.ingest(&batch).await.unwrap();

    eventually("minute average", || async {
        (value_at(&pipeline, Granularity::Minute, "temperature", 1513616400).await == Some(40.0))
            .then_some(())
    })
    .await;

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_last_ignores_older_redelivery() {
    let pipeline = started_pipeline().await;
    pipeline
        .policies()
        .update_policy("status", "UTC", "last", None)
        .await
        .unwrap();

    pipeline
        .ingest(&parse_batch(r#"{"status": [[1513616410, 5]]}"#).unwrap())
        .await
        .unwrap();
    eventually("first last value", || async {
        (value_at(&pipeline, Granularity::Minute, "status", 1513616400).await == Some(5.0)).then_some(())
    })
    .await;

    // The marker series sorts after "status", so its minute rollup lands
    // after the older point has been processed on the same shard.
    pipeline
        .ingest(&parse_batch(r#"{"status": [[1513616405, 7]], "zz_marker": [[1513616405, 1]]}"#).unwrap())
        .await
        .unwrap();
    eventually("marker rollup", || async {
        value_at(&pipeline, Granularity::Minute, "zz_marker", 1513616400).await
    })
    .await;

    assert_eq!(value_at(&pipeline, Granularity::Minute, "status", 1513616400).await, Some(5.0));
    assert_eq!(value_at(&pipeline, Granularity::Second, "status", 1513616405).await, Some(7.0));

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrected_point_nets_out_of_sum() {
    let pipeline = started_pipeline().await;
    pipeline
        .ingest(&parse_batch(r#"{"flow": [[1513616400, 1], [1513616401, 4]]}"#).unwrap())
        .await
        .unwrap();
    eventually("initial sum", || async {
        (value_at(&pipeline, Granularity::Hour, "flow", 1513616400).await == Some(5.0)).then_some(())
    })
    .await;

    // A new value for an existing second replaces it; an identical one is a no-op.
    pipeline
        .ingest(&parse_batch(r#"{"flow": [[1513616400, 3], [1513616401, 4]]}"#).unwrap())
        .await
        .unwrap();
    eventually("corrected sum", || async {
        (value_at(&pipeline, Granularity::Hour, "flow", 1513616400).await == Some(7.0)).then_some(())
    })
    .await;

    let report = pipeline.shutdown().await.unwrap();
    assert_eq!(report.pump.changes, 3);
}

#[tokio::test]
async fn test_max_and_count_rollups() {
    let pipeline = started_pipeline().await;
    let policies = pipeline.policies();
    policies.update_policy("peak", "UTC", "max", None).await.unwrap();
    policies.update_policy("hits", "UTC", "count", None).await.unwrap();

    let batch = parse_batch(
        r#"{"peak": [[1513616400, 3], [1513616401, 9], [1513616402, -20]],
            "hits": [[1513616400, 3], [1513616401, 9], [1513616402, -20]]}"#,
    )
    .unwrap();
    pipeline.ingest(&batch).await.unwrap();

    eventually("max and count", || async {
        let peak = value_at(&pipeline, Granularity::Day, "peak", 1513555200).await;
        let hits = value_at(&pipeline, Granularity::Day, "hits", 1513555200).await;
        (peak == Some(9.0) && hits == Some(3.0)).then_some(())
    })
    .await;

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_policy_delete_and_default_recreation() {
    let pipeline = started_pipeline().await;
    let policies = pipeline.policies();
    policies
        .update_policy("pressure", "Europe/Madrid", "min", None)
        .await
        .unwrap();

    let listed = policies.policies(None).await.unwrap();
    assert!(listed.iter().any(|p| p.series.as_deref() == Some("pressure")));

    assert_eq!(policies.delete(&["pressure".to_string()]).await.unwrap(), 1);
    let listed = policies.policies(None).await.unwrap();
    assert!(!listed.iter().any(|p| p.series.as_deref() == Some("pressure")));

    let recreated = policies
        .policies(Some(&["pressure".to_string()]))
        .await
        .unwrap();
    assert_eq!(recreated.len(), 1);
    assert!(recreated[0].default);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_series_rejected_without_default_policy() {
    let config = RollupConfig::default().with_sleep_interval(Duration::from_millis(5));
    let mut pipeline = Pipeline::new(config).unwrap();
    pipeline.start().await.unwrap();

    let batch = parse_batch(r#"{"unknown": [[1513616400, 1]]}"#).unwrap();
    assert!(pipeline.ingest(&batch).await.is_err());
    assert!(pipeline.store().is_empty());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expired_records_are_purged() {
    let pipeline = started_pipeline().await;
    pipeline
        .ingest(&parse_batch(r#"{"old": [[1513616400, 1]]}"#).unwrap())
        .await
        .unwrap();
    eventually("yearly rollup", || async {
        // 2017-01-01 00:00 Europe/Madrid
        value_at(&pipeline, Granularity::Year, "old", 1483225200).await
    })
    .await;

    // Past the second retention (3 days) but inside every other one.
    let purged = pipeline.purge_expired(1513616400 + 3 * 86400).await.unwrap();
    assert_eq!(purged, 1);
    assert_eq!(value_at(&pipeline, Granularity::Second, "old", 1513616400).await, None);
    assert!(value_at(&pipeline, Granularity::Minute, "old", 1513616400).await.is_some());

    pipeline.shutdown().await.unwrap();
}
