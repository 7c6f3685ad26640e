//! Rollup Streaming Fanout
//!
//! Turns accepted finest-granularity points into one rollup event per
//! coarser granularity. Policies are resolved once per distinct series in
//! a batch and embedded in every event of that series.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::event::DerivedEvent;
use crate::transport::{OutgoingRecord, StreamTransport};
use rollup_common::{Disposition, Granularity, Result};
use rollup_timeseries::policy::aggregation_from_series_name;
use rollup_timeseries::{PolicyResolver, SeriesPolicy, TimeSeriesPoint};
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Fanout Report
// =============================================================================

/// Summary of one fanout call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub points: usize,
    pub published: usize,
    /// Series dropped because no policy could be resolved.
    pub skipped_series: Vec<String>,
}

// =============================================================================
// Stream Fanout
// =============================================================================

/// Publishes rollup events for accepted points.
#[derive(Clone)]
pub struct StreamFanout {
    transport: Arc<dyn StreamTransport>,
    resolver: PolicyResolver,
    publish_batch_size: usize,
    aggregation_from_series_name: bool,
}

impl StreamFanout {
    pub fn new(transport: Arc<dyn StreamTransport>, resolver: PolicyResolver) -> Self {
        Self {
            transport,
            resolver,
            publish_batch_size: 100,
            aggregation_from_series_name: false,
        }
    }

    pub fn with_publish_batch_size(mut self, size: usize) -> Self {
        self.publish_batch_size = size.max(1);
        self
    }

    /// Let a `____<method>` series suffix override the stored method.
    pub fn with_aggregation_from_series_name(mut self, enabled: bool) -> Self {
        self.aggregation_from_series_name = enabled;
        self
    }

    /// Emit one event per rollup granularity for every point.
    pub async fn fanout(&self, points: &[TimeSeriesPoint]) -> Result<FanoutReport> {
        let mut report = FanoutReport {
            points: points.len(),
            ..Default::default()
        };
        let policies = self.resolve_policies(points, &mut report).await?;

        let mut pending = Vec::with_capacity(self.publish_batch_size);
        for point in points {
            let Some(policy) = policies.get(&point.series) else {
                continue;
            };
            for target in Granularity::rollup_targets() {
                let event = DerivedEvent::rollup(target, point, policy);
                pending.push(OutgoingRecord::new(event.partition_key(), event.encode()?));
                if pending.len() == self.publish_batch_size {
                    report.published += self.publish(std::mem::take(&mut pending)).await?;
                }
            }
        }
        if !pending.is_empty() {
            report.published += self.publish(pending).await?;
        }

        tracing::debug!(
            "Fanout of {} points published {} events",
            report.points,
            report.published
        );
        Ok(report)
    }

    async fn resolve_policies(
        &self,
        points: &[TimeSeriesPoint],
        report: &mut FanoutReport,
    ) -> Result<HashMap<String, SeriesPolicy>> {
        let mut policies = HashMap::new();
        for point in points {
            if policies.contains_key(&point.series) || report.skipped_series.contains(&point.series) {
                continue;
            }
            match self.resolver.resolve(&point.series).await {
                Ok(policy) => {
                    policies.insert(point.series.clone(), self.apply_overrides(&point.series, policy));
                }
                Err(e) if e.disposition() != Disposition::Retryable => {
                    tracing::warn!("Cannot roll up {}: {}", point.series, e);
                    report.skipped_series.push(point.series.clone());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(policies)
    }

    fn apply_overrides(&self, series: &str, policy: SeriesPolicy) -> SeriesPolicy {
        if !self.aggregation_from_series_name {
            return policy;
        }
        match aggregation_from_series_name(series) {
            Some(method) => policy.with_aggregation(method),
            None => policy,
        }
    }

    async fn publish(&self, records: Vec<OutgoingRecord>) -> Result<usize> {
        self.transport.put_records(records).await
    }
}

// =============================================================================
// Tests
// =============================================================================
