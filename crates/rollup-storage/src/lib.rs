//! Rollup Storage - Rollup Table Storage Layer
//!
//! Storage abstraction for the per-granularity rollup tables and an
//! in-memory backend implementing it. Every cross-writer guarantee of the
//! pipeline rests on the conditional primitives defined here.
//!
//! Key Features:
//! - Pluggable async storage interface
//! - Atomic increment and conditional put primitives
//! - Batch writes with unprocessed-item reporting
//! - Change capture on the finest table
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod backend;
pub mod changes;
pub mod memory;

pub use backend::{
    BatchWriteOutcome, RecordUpdate, RollupStore, StorageStats, UpdateCondition, UpdateOutcome,
};
pub use changes::{ChangeKind, ChangeRecord};
pub use memory::MemoryStore;
