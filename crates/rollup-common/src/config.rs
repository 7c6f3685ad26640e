//! Rollup Config - Configuration Structures
//!
//! Configuration types for the rollup pipeline. Supports loading from TOML
//! files, overlaying the environment variables the pipeline has always
//! honoured, and programmatic construction with builder methods.
//!
//! Key Features:
//! - Storage configuration (table prefix, batch-write limit)
//! - Ingest configuration (stream name, publish batching, default policies)
//! - Consumer configuration (poll tuning, parameter reload)
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::error::{Result, RollupError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_TABLE_PREFIX: &str = "TABLE_PREFIX";
pub const ENV_BATCH_SIZE: &str = "BATCH_SIZE";
pub const ENV_ADD_DEFAULT: &str = "ADD_DEFAULT";
pub const ENV_AGG_IN_SERIE: &str = "AGG_IN_SERIE";

// =============================================================================
// Storage Configuration
// =============================================================================

/// Configuration for the rollup tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub table_prefix: Option<String>,
    /// Largest batch the storage layer accepts in one write.
    pub max_batch_write: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            table_prefix: None,
            max_batch_write: 25,
        }
    }
}

// =============================================================================
// Ingest Configuration
// =============================================================================

/// What to do when a series has no stored policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicyMode {
    /// Persist and use a default policy.
    Create,
    /// Reject the series.
    Fail,
}

/// Configuration for the producer and the fanout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub stream_name: String,
    pub publish_batch_size: usize,
    pub default_policy: DefaultPolicyMode,
    pub aggregation_from_series_name: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            stream_name: "ts_stream".to_string(),
            publish_batch_size: 100,
            default_policy: DefaultPolicyMode::Fail,
            aggregation_from_series_name: false,
        }
    }
}

// =============================================================================
// Consumer Configuration
// =============================================================================

/// Configuration for the shard consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Initial number of records pulled per poll.
    pub batch_size: usize,
    /// Initial pause between polls, in milliseconds.
    pub sleep_interval_ms: u64,
    /// JSON file holding `BATCH_SIZE` and `SLEEP_TIME` overrides.
    pub parameters_file: Option<String>,
    pub reload_interval_secs: u64,
    /// Largest group of change records handed to the fanout at once.
    pub change_batch_size: usize,
}

impl ConsumerConfig {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            sleep_interval_ms: 200,
            parameters_file: None,
            reload_interval_secs: 10,
            change_batch_size: 100,
        }
    }
}

// =============================================================================
// Rollup Configuration
// =============================================================================

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub consumer: ConsumerConfig,
}

impl RollupConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RollupError::Configuration(e.to_string()))
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Overlay the process environment on top of this configuration.
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|key| std::env::var(key).ok())
    }

    /// Overlay variables from an arbitrary lookup.
    pub fn with_vars<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup(ENV_TABLE_PREFIX) {
            self.storage.table_prefix = Some(prefix).filter(|p| !p.is_empty());
        }
        if let Some(size) = lookup(ENV_BATCH_SIZE) {
            self.ingest.publish_batch_size = size.trim().parse().map_err(|_| {
                RollupError::Configuration(format!("{} is not a number: {}", ENV_BATCH_SIZE, size))
            })?;
        }
        if lookup(ENV_ADD_DEFAULT).is_some() {
            self.ingest.default_policy = DefaultPolicyMode::Create;
        }
        if let Some(flag) = lookup(ENV_AGG_IN_SERIE) {
            self.ingest.aggregation_from_series_name = parse_flag(&flag);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.storage.table_prefix = Some(prefix).filter(|p| !p.is_empty());
        self
    }

    pub fn with_default_policy(mut self, mode: DefaultPolicyMode) -> Self {
        self.ingest.default_policy = mode;
        self
    }

    pub fn with_parameters_file(mut self, path: impl Into<String>) -> Self {
        self.consumer.parameters_file = Some(path.into());
        self
    }

    pub fn with_sleep_interval(mut self, interval: Duration) -> Self {
        self.consumer.sleep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Name of the derived-event stream, prefixed like the tables.
    pub fn stream_name(&self) -> String {
        match self.storage.table_prefix.as_deref() {
            Some(prefix) => format!("{}_{}", prefix, self.ingest.stream_name),
            None => self.ingest.stream_name.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.max_batch_write == 0 {
            return Err(RollupError::Configuration(
                "storage.max_batch_write must be positive".into(),
            ));
        }
        if self.ingest.publish_batch_size == 0 {
            return Err(RollupError::Configuration(
                "ingest.publish_batch_size must be positive".into(),
            ));
        }
        if self.consumer.batch_size == 0 {
            return Err(RollupError::Configuration(
                "consumer.batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no"
    )
}

// =============================================================================
// Tests
// =============================================================================
