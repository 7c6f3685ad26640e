//! Rollup Streaming Ingest
//!
//! Producer side of the pipeline. Incoming batches of raw points are
//! validated against series policies and published as direct events that
//! the finest-granularity consumer writes to storage.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::event::DerivedEvent;
use crate::transport::{OutgoingRecord, StreamTransport};
use rollup_common::utils::into_chunks;
use rollup_common::{Granularity, Result, RollupError};
use rollup_timeseries::{bucket_start, PolicyResolver, TimeSeriesPoint};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Raw points keyed by series: `{"series": [[time, value], ...]}`.
pub type PointBatch = BTreeMap<String, Vec<(i64, f64)>>;

/// Parse a JSON point batch.
pub fn parse_batch(json: &str) -> Result<PointBatch> {
    serde_json::from_str(json).map_err(|e| RollupError::MalformedEvent(e.to_string()))
}

// =============================================================================
// Ingestor
// =============================================================================

/// Publishes raw points as direct events.
#[derive(Clone)]
pub struct Ingestor {
    transport: Arc<dyn StreamTransport>,
    resolver: PolicyResolver,
    publish_batch_size: usize,
}

impl Ingestor {
    pub fn new(transport: Arc<dyn StreamTransport>, resolver: PolicyResolver) -> Self {
        Self {
            transport,
            resolver,
            publish_batch_size: 100,
        }
    }

    pub fn with_publish_batch_size(mut self, size: usize) -> Self {
        self.publish_batch_size = size.max(1);
        self
    }

    /// Publish every point of `batch`. All series are resolved before
    /// anything is published, so an unknown series rejects the whole batch.
    pub async fn put_points(&self, batch: &PointBatch) -> Result<usize> {
        let policies = self.resolver.resolve_many(batch.keys().map(String::as_str)).await?;

        let mut records = Vec::with_capacity(batch.values().map(Vec::len).sum());
        for (series, points) in batch {
            let Some(policy) = policies.get(series) else {
                continue;
            };
            for (time, value) in points {
                let time = bucket_start(Granularity::FINEST, *time, Some(policy.timezone.as_str()))?;
                let ttl = policy.ttl(Granularity::FINEST, time)?;
                let point = TimeSeriesPoint::new(series.clone(), time, *value);
                tracing::debug!("Insert item {} {} {}", series, time, value);
                let event = DerivedEvent::direct(&point, ttl);
                records.push(OutgoingRecord::new(event.partition_key(), event.encode()?));
            }
        }

        let mut published = 0;
        for chunk in into_chunks(records, self.publish_batch_size) {
            published += self.transport.put_records(chunk).await?;
        }
        tracing::info!("Published {} points from {} series", published, batch.len());
        Ok(published)
    }
}

// =============================================================================
// Tests
// =============================================================================
