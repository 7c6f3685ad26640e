//! Rollup Server Consumer
//!
//! Supervises one shard worker per transport shard plus the background
//! parameters reloader. Every worker is positioned before any of them is
//! spawned, so a misconfigured stream fails before consumption starts.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::batch::BatchWriter;
use crate::params::{ConsumerParams, ParamsReloader};
use crate::worker::{ShardConsumer, WorkerExit};
use rollup_common::{Result, RollupConfig, RollupError};
use rollup_storage::RollupStore;
use rollup_streaming::StreamTransport;
use rollup_timeseries::AggregationEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Rollup Consumer
// =============================================================================

/// Runs every shard worker of a stream.
pub struct RollupConsumer {
    transport: Arc<dyn StreamTransport>,
    engine: AggregationEngine,
    writer: BatchWriter,
    params: Arc<watch::Sender<ConsumerParams>>,
    parameters_file: Option<PathBuf>,
    reload_interval: Duration,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<Result<WorkerExit>>>,
    reloader: Option<JoinHandle<()>>,
}

impl RollupConsumer {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn RollupStore>,
        config: &RollupConfig,
    ) -> Self {
        let (params, _) = watch::channel(ConsumerParams::from_config(&config.consumer));
        Self {
            transport,
            writer: BatchWriter::new(store.clone(), config.storage.max_batch_write),
            engine: AggregationEngine::new(store),
            params: Arc::new(params),
            parameters_file: config.consumer.parameters_file.as_ref().map(PathBuf::from),
            reload_interval: config.consumer.reload_interval(),
            cancel: CancellationToken::new(),
            workers: Vec::new(),
            reloader: None,
        }
    }

    /// Current parameters snapshot.
    pub fn params(&self) -> ConsumerParams {
        *self.params.borrow()
    }

    /// Publish new parameters to every worker.
    pub fn set_params(&self, params: ConsumerParams) {
        self.params.send_replace(params);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Token cancelled by [`RollupConsumer::stop`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Position and spawn one worker per shard. Returns the worker count.
    pub async fn start(&mut self) -> Result<usize> {
        if !self.workers.is_empty() {
            return Err(RollupError::Internal("consumer already started".to_string()));
        }

        let shards = self.transport.list_shards().await?;
        let mut consumers = Vec::with_capacity(shards.len());
        for shard in shards {
            let mut consumer = ShardConsumer::new(
                shard,
                self.transport.clone(),
                self.engine.clone(),
                self.writer.clone(),
                self.params.subscribe(),
            );
            consumer.init().await?;
            consumers.push(consumer);
        }

        for consumer in consumers {
            tracing::debug!("Spawning worker for {}", consumer.shard());
            let cancel = self.cancel.child_token();
            self.workers.push(tokio::spawn(consumer.run(cancel)));
        }

        if let Some(path) = &self.parameters_file {
            let reloader = ParamsReloader::new(path.clone(), self.reload_interval, self.params.clone());
            self.reloader = Some(tokio::spawn(reloader.run(self.cancel.child_token())));
        }

        tracing::info!("Started {} shard workers", self.workers.len());
        Ok(self.workers.len())
    }

    /// Ask every worker to stop after its current batch.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for every worker to finish. All workers are awaited even if
    /// one failed; the first failure is returned.
    pub async fn join(mut self) -> Result<Vec<WorkerExit>> {
        let mut exits = Vec::with_capacity(self.workers.len());
        let mut first_error = None;

        for handle in self.workers.drain(..) {
            match handle.await {
                Ok(Ok(exit)) => exits.push(exit),
                Ok(Err(e)) => {
                    tracing::error!("Worker failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!("Worker panicked: {}", e);
                    first_error.get_or_insert(RollupError::Internal(e.to_string()));
                }
            }
        }

        self.cancel.cancel();
        if let Some(reloader) = self.reloader.take() {
            if let Err(e) = reloader.await {
                tracing::warn!("Parameters reloader panicked: {}", e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(exits),
        }
    }

    /// Stop and wait for every worker.
    pub async fn shutdown(self) -> Result<Vec<WorkerExit>> {
        self.stop();
        self.join().await
    }
}

// =============================================================================
// Tests
// =============================================================================
