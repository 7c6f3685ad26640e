//! Rollup Streaming - Derived Event Stream
//!
//! Everything that moves points between the producer, the finest table and
//! the rollup consumers: the event wire format, the partitioned transport,
//! the fanout of accepted points and the change feed bridging them.
//!
//! Key Features:
//! - JSON derived events with embedded series policy
//! - Pull-based transport partitioned by granularity
//! - Fanout with per-batch policy resolution
//! - Producer ingestion and change data capture pump
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod cdc;
pub mod event;
pub mod fanout;
pub mod ingest;
pub mod transport;

pub use cdc::{change_to_point, ChangeFeedPump, PumpStats};
pub use event::{DerivedEvent, EventData};
pub use fanout::{FanoutReport, StreamFanout};
pub use ingest::{parse_batch, Ingestor, PointBatch};
pub use transport::{
    GetRecordsOutput, MemoryTransport, OutgoingRecord, ShardCursor, StreamRecord, StreamTransport,
};
