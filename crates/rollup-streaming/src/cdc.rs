//! Rollup Streaming CDC (Change Data Capture)
//!
//! Bridges the finest table's change feed to the fanout. Every insert or
//! modification of a one-second record becomes a point; modifications carry
//! the previous value so additive rollups can net out the correction.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::fanout::StreamFanout;
use rollup_common::Result;
use rollup_storage::{ChangeKind, ChangeRecord};
use rollup_timeseries::TimeSeriesPoint;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Point derived from a captured change.
pub fn change_to_point(change: &ChangeRecord) -> TimeSeriesPoint {
    let record = &change.new_image;
    let point = TimeSeriesPoint::new(record.series.clone(), record.time, record.value);
    match (change.kind, change.old_value()) {
        (ChangeKind::Modify, Some(old)) => point.with_old_value(old),
        _ => point,
    }
}

// =============================================================================
// Pump Statistics
// =============================================================================

/// Counters of a finished pump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub changes: u64,
    pub batches: u64,
    pub published: u64,
    pub lagged: u64,
    pub failed_batches: u64,
}

// =============================================================================
// Change Feed Pump
// =============================================================================

/// Drains a change feed into the fanout in batches.
pub struct ChangeFeedPump {
    receiver: broadcast::Receiver<ChangeRecord>,
    fanout: StreamFanout,
    batch_size: usize,
}

impl ChangeFeedPump {
    pub fn new(receiver: broadcast::Receiver<ChangeRecord>, fanout: StreamFanout) -> Self {
        Self {
            receiver,
            fanout,
            batch_size: 100,
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Run until cancelled or until the feed closes.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<PumpStats> {
        let mut stats = PumpStats::default();

        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.receiver.recv() => received,
            };

            let mut batch = Vec::with_capacity(self.batch_size);
            match first {
                Ok(change) => batch.push(change_to_point(&change)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Change feed lagged, {} changes were lost", missed);
                    stats.lagged += missed;
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }

            while batch.len() < self.batch_size {
                match self.receiver.try_recv() {
                    Ok(change) => batch.push(change_to_point(&change)),
                    Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                        tracing::warn!("Change feed lagged, {} changes were lost", missed);
                        stats.lagged += missed;
                    }
                    Err(_) => break,
                }
            }

            stats.changes += batch.len() as u64;
            stats.batches += 1;
            tracing::debug!("Batch of {} change records", batch.len());

            match self.fanout.fanout(&batch).await {
                Ok(report) => stats.published += report.published as u64,
                Err(e) => {
                    stats.failed_batches += 1;
                    tracing::error!("Fanout of {} changes failed: {}", batch.len(), e);
                }
            }
        }

        tracing::info!(
            "Change feed pump stopped after {} changes in {} batches",
            stats.changes,
            stats.batches
        );
        Ok(stats)
    }
}

// =============================================================================
// Tests
// =============================================================================
