//! Rollup Server - Stream Consumer
//!
//! Drains derived events from every transport shard into the rollup
//! tables and wires the complete in-memory pipeline.
//!
//! Key Features:
//! - One worker per shard with cooperative shutdown
//! - Concurrent chunked batch writes with unprocessed-item resubmission
//! - Hot-reloadable batch size and poll interval
//! - End-to-end pipeline from raw points to queryable rollups
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod batch;
pub mod consumer;
pub mod params;
pub mod pipeline;
pub mod worker;

pub use batch::BatchWriter;
pub use consumer::RollupConsumer;
pub use params::{load_params, ConsumerParams, ParamsReloader};
pub use pipeline::{Pipeline, PipelineReport};
pub use worker::{ShardConsumer, WorkerExit, WorkerState, WorkerStats};
