//! Rollup Server Pipeline
//!
//! Wires the in-memory pipeline together: producer, finest table with
//! change capture, change feed pump, fanout, shard workers and query
//! service, all sharing one store and one transport.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::consumer::RollupConsumer;
use crate::params::ConsumerParams;
use crate::worker::WorkerExit;
use rollup_common::{Granularity, Result, RollupConfig, RollupError};
use rollup_storage::{MemoryStore, RollupStore};
use rollup_streaming::{ChangeFeedPump, Ingestor, MemoryTransport, PointBatch, PumpStats, StreamFanout};
use rollup_timeseries::{MemoryPolicyDirectory, PolicyResolver, QueryService, RangeQuery, SeriesData};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Final counters of a stopped pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub workers: Vec<WorkerExit>,
    pub pump: PumpStats,
}

// =============================================================================
// Pipeline
// =============================================================================

/// The complete ingestion and rollup pipeline.
pub struct Pipeline {
    config: RollupConfig,
    store: Arc<MemoryStore>,
    transport: Arc<MemoryTransport>,
    resolver: PolicyResolver,
    ingestor: Ingestor,
    query: QueryService,
    consumer: RollupConsumer,
    pump: Option<JoinHandle<Result<PumpStats>>>,
    pump_cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: RollupConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(
            MemoryStore::new()
                .with_table_prefix(config.storage.table_prefix.clone())
                .with_change_capture(Granularity::FINEST),
        );
        let transport = Arc::new(MemoryTransport::per_granularity(config.stream_name()));
        let resolver = PolicyResolver::new(
            Arc::new(MemoryPolicyDirectory::new()),
            config.ingest.default_policy,
        );
        let ingestor = Ingestor::new(transport.clone(), resolver.clone())
            .with_publish_batch_size(config.ingest.publish_batch_size);
        let consumer = RollupConsumer::new(transport.clone(), store.clone(), &config);

        Ok(Self {
            query: QueryService::new(store.clone()),
            config,
            store,
            transport,
            resolver,
            ingestor,
            consumer,
            pump: None,
            pump_cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &RollupConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }

    /// Policy lookup and management.
    pub fn policies(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn consumer(&self) -> &RollupConsumer {
        &self.consumer
    }

    pub fn set_params(&self, params: ConsumerParams) {
        self.consumer.set_params(params);
    }

    /// Start the change feed pump and the shard workers.
    pub async fn start(&mut self) -> Result<()> {
        if self.pump.is_some() {
            return Err(RollupError::Internal("pipeline already started".to_string()));
        }

        let receiver = self.store.subscribe_changes().ok_or_else(|| {
            RollupError::Internal("change capture is not enabled on the store".to_string())
        })?;
        let fanout = StreamFanout::new(self.transport.clone(), self.resolver.clone())
            .with_publish_batch_size(self.config.ingest.publish_batch_size)
            .with_aggregation_from_series_name(self.config.ingest.aggregation_from_series_name);
        let pump = ChangeFeedPump::new(receiver, fanout)
            .with_batch_size(self.config.consumer.change_batch_size);
        self.pump = Some(tokio::spawn(pump.run(self.pump_cancel.clone())));

        self.consumer.start().await?;
        tracing::info!(
            "Pipeline started on stream {} with tables {}",
            self.transport.stream_name(),
            self.store.table_name(Granularity::FINEST)
        );
        Ok(())
    }

    /// Ingest raw points.
    pub async fn ingest(&self, batch: &PointBatch) -> Result<usize> {
        self.ingestor.put_points(batch).await
    }

    pub async fn query(&self, query: &RangeQuery) -> Result<SeriesData> {
        self.query.query(query).await
    }

    pub async fn latest(&self, series: &[String], granularity: Granularity) -> Result<SeriesData> {
        self.query.latest(series, granularity).await
    }

    /// Drop records whose TTL has elapsed.
    pub async fn purge_expired(&self, now: i64) -> Result<usize> {
        self.store.purge_expired(now).await
    }

    /// Stop the workers, then the pump.
    pub async fn shutdown(self) -> Result<PipelineReport> {
        let workers = self.consumer.shutdown().await?;

        self.pump_cancel.cancel();
        let pump = match self.pump {
            Some(handle) => handle
                .await
                .map_err(|e| RollupError::Internal(e.to_string()))??,
            None => PumpStats::default(),
        };

        tracing::info!("Pipeline stopped");
        Ok(PipelineReport { workers, pump })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_common::DefaultPolicyMode;

    #[tokio::test]
    async fn test_prefixed_names() {
        let config = RollupConfig::default().with_table_prefix("dev");
        let pipeline = Pipeline::new(config).unwrap();
        assert_eq!(pipeline.transport().stream_name(), "dev_ts_stream");
        assert_eq!(pipeline.store().table_name(Granularity::Hour), "dev_timeseries_hour");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = RollupConfig::default();
        config.storage.max_batch_write = 0;
        let err = Pipeline::new(config).err().expect("config should be rejected");
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let config = RollupConfig::default().with_default_policy(DefaultPolicyMode::Create);
        let mut pipeline = Pipeline::new(config).unwrap();
        pipeline.start().await.unwrap();
        assert!(pipeline.start().await.is_err());

        let report = pipeline.shutdown().await.unwrap();
        assert_eq!(report.workers.len(), 6);
        assert_eq!(report.pump.changes, 0);
    }
}
