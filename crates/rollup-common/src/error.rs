//! Rollup Error - Unified Error Types
//!
//! Error handling for every stage of the rollup pipeline. Errors are grouped
//! by domain (configuration, data, storage, transport) and each variant maps
//! to a disposition that tells the stream consumer whether to give up, move
//! on, or drop a single record.
//!
//! Key Features:
//! - Domain-specific error variants for precise error handling
//! - Explicit fatal / retryable / drop classification
//! - Configuration vs data error predicates
//! - Seamless integration with std::io::Error
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::types::Granularity;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Unified error type for all rollup operations.
#[derive(Error, Debug)]
pub enum RollupError {
    // Configuration errors
    #[error("unknown granularity: {0}")]
    UnknownGranularity(String),

    #[error("unsupported aggregation: {0}")]
    UnsupportedAggregation(String),

    #[error("timezone required for {0} granularity")]
    MissingTimezone(Granularity),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("no retention configured for {granularity} on series {series}")]
    MissingRetention {
        series: String,
        granularity: Granularity,
    },

    #[error("no finer granularity than {0}")]
    NoFinerGranularity(Granularity),

    #[error("policy not found for series: {0}")]
    PolicyNotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Data errors
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("missing field: {0}")]
    MissingField(String),

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("throughput exceeded on table {0}")]
    Throttled(String),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Type Aliases
// =============================================================================

/// Result type alias for rollup operations.
pub type Result<T> = std::result::Result<T, RollupError>;

// =============================================================================
// Disposition
// =============================================================================

/// What a caller processing a stream of records should do after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The request itself is wrong; retrying cannot help.
    Fatal,
    /// A transient condition; a later attempt may succeed.
    Retryable,
    /// The offending record is unusable; skip it and keep going.
    Drop,
}

// =============================================================================
// Error Classification
// =============================================================================

impl RollupError {
    /// Classify the error for the consumer loop.
    pub fn disposition(&self) -> Disposition {
        match self {
            RollupError::MalformedEvent(_) | RollupError::MissingField(_) => Disposition::Drop,
            RollupError::Storage(_)
            | RollupError::Throttled(_)
            | RollupError::Transport(_)
            | RollupError::Io(_) => Disposition::Retryable,
            RollupError::UnknownGranularity(_)
            | RollupError::UnsupportedAggregation(_)
            | RollupError::MissingTimezone(_)
            | RollupError::InvalidTimezone(_)
            | RollupError::MissingRetention { .. }
            | RollupError::NoFinerGranularity(_)
            | RollupError::PolicyNotFound(_)
            | RollupError::Configuration(_)
            | RollupError::ShardNotFound(_)
            | RollupError::Serialization(_)
            | RollupError::Internal(_) => Disposition::Fatal,
        }
    }

    /// Returns true if the operation can be safely retried.
    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retryable
    }

    /// Returns true if this error comes from invalid configuration rather
    /// than from the data or the environment.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            RollupError::UnknownGranularity(_)
                | RollupError::UnsupportedAggregation(_)
                | RollupError::MissingTimezone(_)
                | RollupError::InvalidTimezone(_)
                | RollupError::MissingRetention { .. }
                | RollupError::NoFinerGranularity(_)
                | RollupError::Configuration(_)
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
