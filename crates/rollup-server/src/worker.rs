//! Rollup Server Shard Worker
//!
//! One worker per transport shard. A worker starts at the shard's latest
//! position, pulls batches of derived events, writes direct events through
//! the batch writer and folds rollup events through the aggregation
//! engine, then sleeps before the next poll.
//!
//! Key Features:
//! - Explicit INIT / POLLING / DRAINED / STOPPED lifecycle
//! - Per-record error disposition (drop, skip, abandon batch)
//! - Cooperative stop checked between iterations
//! - Hot-reloaded batch size and poll interval
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::batch::BatchWriter;
use crate::params::ConsumerParams;
use rollup_common::{Disposition, Granularity, Result, RollupError};
use rollup_streaming::{DerivedEvent, ShardCursor, StreamRecord, StreamTransport};
use rollup_timeseries::{AggregationEngine, AggregationOutcome};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Worker State
// =============================================================================

/// Lifecycle of a shard worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Polling,
    /// The shard was closed and fully read.
    Drained,
    /// A stop was requested.
    Stopped,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Drained | WorkerState::Stopped)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Init => "init",
            WorkerState::Polling => "polling",
            WorkerState::Drained => "drained",
            WorkerState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Counters of one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub polls: u64,
    pub records: u64,
    pub written: u64,
    pub applied: u64,
    pub rejected: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub failed_batches: u64,
    pub failed_polls: u64,
}

/// How a worker finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub shard: String,
    pub state: WorkerState,
    pub stats: WorkerStats,
}

/// Loop time in seconds and records per second for one iteration. The
/// loop covers the poll, the writes and the sleep that follows them.
fn throughput(records: usize, work: Duration, sleep: Duration) -> (f64, f64) {
    let loop_time = (work + sleep).as_secs_f64();
    let units = if loop_time > 0.0 {
        records as f64 / loop_time
    } else {
        records as f64
    };
    (loop_time, units)
}

// =============================================================================
// Shard Consumer
// =============================================================================

/// Consumes one shard into storage.
pub struct ShardConsumer {
    shard: String,
    transport: Arc<dyn StreamTransport>,
    engine: AggregationEngine,
    writer: BatchWriter,
    params: watch::Receiver<ConsumerParams>,
    state: WorkerState,
    cursor: Option<ShardCursor>,
    stats: WorkerStats,
}

impl ShardConsumer {
    pub fn new(
        shard: impl Into<String>,
        transport: Arc<dyn StreamTransport>,
        engine: AggregationEngine,
        writer: BatchWriter,
        params: watch::Receiver<ConsumerParams>,
    ) -> Self {
        Self {
            shard: shard.into(),
            transport,
            engine,
            writer,
            params,
            state: WorkerState::Init,
            cursor: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Position the worker at the shard's latest record.
    pub async fn init(&mut self) -> Result<()> {
        if self.state != WorkerState::Init {
            return Ok(());
        }
        let cursor = self.transport.latest_cursor(&self.shard).await?;
        tracing::debug!("Worker for {} starting at {}", self.shard, cursor);
        self.cursor = Some(cursor);
        self.state = WorkerState::Polling;
        Ok(())
    }

    /// Poll until the shard drains or `cancel` fires. Only a fatal
    /// transport error ends the worker with an error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<WorkerExit> {
        self.init().await?;

        while self.state == WorkerState::Polling {
            if cancel.is_cancelled() {
                self.state = WorkerState::Stopped;
                break;
            }

            let params = *self.params.borrow_and_update();
            self.poll_once(params.batch_size).await?;
            if self.state.is_terminal() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => self.state = WorkerState::Stopped,
                _ = tokio::time::sleep(params.sleep_interval) => {}
            }
        }

        tracing::info!("Worker for {} {}", self.shard, self.state);
        Ok(WorkerExit {
            shard: self.shard,
            state: self.state,
            stats: self.stats,
        })
    }

    /// Run a single poll iteration.
    pub async fn poll_once(&mut self, batch_size: usize) -> Result<()> {
        let Some(cursor) = self.cursor.clone() else {
            return Err(RollupError::Internal(format!(
                "worker for {} polled before init",
                self.shard
            )));
        };

        let started = Instant::now();
        self.stats.polls += 1;
        let output = match self.transport.get_records(&cursor, batch_size).await {
            Ok(output) => output,
            Err(e) if e.is_retryable() => {
                self.stats.failed_polls += 1;
                tracing::error!("Polling {} failed: {}", self.shard, e);
                return Ok(());
            }
            Err(e) => {
                self.state = WorkerState::Stopped;
                return Err(e);
            }
        };

        let count = output.records.len();
        let table = self.process(output.records).await;
        match output.next_cursor {
            Some(next) => self.cursor = Some(next),
            None => {
                self.cursor = None;
                self.state = WorkerState::Drained;
            }
        }

        if count > 0 {
            let sleep = self.params.borrow().sleep_interval;
            let (loop_time, units) = throughput(count, started.elapsed(), sleep);
            tracing::info!(
                "table={} records={} loop_time={:.3}s write_units={:.1}/s",
                table.as_deref().unwrap_or(self.shard.as_str()),
                count,
                loop_time,
                units
            );
        }
        Ok(())
    }

    /// Handle one batch, returning the table it targeted.
    async fn process(&mut self, records: Vec<StreamRecord>) -> Option<String> {
        self.stats.records += records.len() as u64;

        let mut events = Vec::with_capacity(records.len());
        for record in records {
            match DerivedEvent::decode(&record.data) {
                Ok(event) => events.push(event),
                Err(e) => {
                    self.stats.dropped += 1;
                    tracing::warn!("Dropping record {} from {}: {}", record.sequence, self.shard, e);
                }
            }
        }
        let table = events
            .first()
            .map(|event| self.engine.store().table_name(event.granularity));

        let (direct, rollups): (Vec<_>, Vec<_>) = events.into_iter().partition(DerivedEvent::is_direct);
        if let Err(e) = self.write_direct(direct).await {
            self.stats.failed_batches += 1;
            tracing::error!("Batch from {} abandoned: {}", self.shard, e);
            return table;
        }
        if let Err(e) = self.apply_rollups(rollups).await {
            self.stats.failed_batches += 1;
            tracing::error!("Batch from {} abandoned: {}", self.shard, e);
        }
        table
    }

    async fn write_direct(&mut self, events: Vec<DerivedEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut records = Vec::with_capacity(events.len());
        for event in &events {
            match event.record() {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.stats.dropped += 1;
                    tracing::warn!("Dropping direct event for {}: {}", event.data.timeserie, e);
                }
            }
        }
        let written = self.writer.write(Granularity::FINEST, records).await?;
        self.stats.written += written as u64;
        Ok(())
    }

    /// A retryable error abandons the rest of the batch; anything else
    /// only skips the offending event.
    async fn apply_rollups(&mut self, events: Vec<DerivedEvent>) -> Result<()> {
        for event in events {
            let result = match event.policy() {
                Ok(policy) => self.engine.apply(event.granularity, &event.point(), policy).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(AggregationOutcome::Applied) => self.stats.applied += 1,
                Ok(AggregationOutcome::Rejected) => self.stats.rejected += 1,
                Ok(AggregationOutcome::Skipped) => self.stats.skipped += 1,
                Err(e) => match e.disposition() {
                    Disposition::Retryable => return Err(e),
                    Disposition::Drop => {
                        self.stats.dropped += 1;
                        tracing::warn!("Dropping {} event for {}: {}", event.granularity, event.data.timeserie, e);
                    }
                    Disposition::Fatal => {
                        self.stats.skipped += 1;
                        tracing::warn!("Skipping {} event for {}: {}", event.granularity, event.data.timeserie, e);
                    }
                },
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
