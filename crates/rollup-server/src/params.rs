//! Rollup Server Parameters
//!
//! Hot-reloadable consumer tuning. Workers read an immutable snapshot of
//! the batch size and poll interval from a watch channel; a background
//! reloader re-reads the parameters file and publishes a new snapshot
//! whenever either value changes.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use rollup_common::{ConsumerConfig, Result, RollupError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Consumer Parameters
// =============================================================================

/// One consistent set of worker tuning values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerParams {
    pub batch_size: usize,
    pub sleep_interval: Duration,
}

impl ConsumerParams {
    pub fn new(batch_size: usize, sleep_interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            sleep_interval,
        }
    }

    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self::new(config.batch_size, config.sleep_interval())
    }

    /// Overlay the values present in a parameters file.
    fn merge(self, file: ParamsFile) -> Result<Self> {
        let batch_size = file.batch_size.unwrap_or(self.batch_size);
        let sleep_interval = match file.sleep_time {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Duration::from_secs_f64(secs),
            Some(secs) => {
                return Err(RollupError::Configuration(format!(
                    "SLEEP_TIME must be a non-negative number of seconds, got {}",
                    secs
                )))
            }
            None => self.sleep_interval,
        };
        Ok(Self::new(batch_size, sleep_interval))
    }
}

impl Default for ConsumerParams {
    fn default() -> Self {
        Self::from_config(&ConsumerConfig::default())
    }
}

#[derive(Debug, Deserialize)]
struct ParamsFile {
    #[serde(rename = "BATCH_SIZE")]
    batch_size: Option<usize>,
    #[serde(rename = "SLEEP_TIME")]
    sleep_time: Option<f64>,
}

/// Read a parameters file on top of `current`.
pub async fn load_params(path: &Path, current: ConsumerParams) -> Result<ConsumerParams> {
    let content = tokio::fs::read_to_string(path).await?;
    let file: ParamsFile =
        serde_json::from_str(&content).map_err(|e| RollupError::Serialization(e.to_string()))?;
    current.merge(file)
}

// =============================================================================
// Parameters Reloader
// =============================================================================

/// Periodically refreshes the shared parameters from a file.
pub struct ParamsReloader {
    path: PathBuf,
    interval: Duration,
    sender: Arc<watch::Sender<ConsumerParams>>,
}

impl ParamsReloader {
    pub fn new(
        path: impl Into<PathBuf>,
        interval: Duration,
        sender: Arc<watch::Sender<ConsumerParams>>,
    ) -> Self {
        Self {
            path: path.into(),
            interval,
            sender,
        }
    }

    /// Reload once. Returns true if a new snapshot was published.
    pub async fn reload(&self) -> Result<bool> {
        let current = *self.sender.borrow();
        let next = load_params(&self.path, current).await?;
        if next == current {
            return Ok(false);
        }

        if next.batch_size != current.batch_size {
            tracing::info!(
                "Changing batch size from {} to {}",
                current.batch_size,
                next.batch_size
            );
        }
        if next.sleep_interval != current.sleep_interval {
            tracing::info!(
                "Changing sleep interval from {:?} to {:?}",
                current.sleep_interval,
                next.sleep_interval
            );
        }
        self.sender.send_replace(next);
        Ok(true)
    }

    /// Reload every interval until cancelled. A failed reload keeps the
    /// previous snapshot.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reload().await {
                        tracing::warn!("Cannot reload parameters from {}: {}", self.path.display(), e);
                    }
                }
            }
        }
        tracing::debug!("Parameters reloader stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
