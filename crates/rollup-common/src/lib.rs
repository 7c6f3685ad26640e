//! Rollup Common - Shared Types and Utilities
//!
//! Foundational types, error handling, and configuration used across all
//! rollup pipeline components. Provides the core abstractions that keep the
//! storage, aggregation and streaming layers speaking the same language.
//!
//! Key Features:
//! - Unified error type with fatal / retryable / drop classification
//! - Granularity ladder and aggregated record types
//! - Configuration structures with TOML and environment loading
//! - Hashing and batching utilities
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::{ConsumerConfig, DefaultPolicyMode, IngestConfig, RollupConfig, StorageConfig};
pub use error::{Disposition, Result, RollupError};
pub use types::*;
