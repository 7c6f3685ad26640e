//! Rollup Server Batch Writer
//!
//! Writes finest-granularity records in chunks no larger than the storage
//! layer's batch limit. Chunks are dispatched concurrently and each one
//! resubmits whatever the store reports as unprocessed until nothing is
//! left.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use futures::future::join_all;
use rollup_common::utils::into_chunks;
use rollup_common::{AggregatedRecord, Granularity, Result};
use rollup_storage::RollupStore;
use std::sync::Arc;

/// Chunked batch writer with unprocessed-item resubmission.
#[derive(Clone)]
pub struct BatchWriter {
    store: Arc<dyn RollupStore>,
    max_batch_write: usize,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn RollupStore>, max_batch_write: usize) -> Self {
        Self {
            store,
            max_batch_write: max_batch_write.max(1),
        }
    }

    pub fn max_batch_write(&self) -> usize {
        self.max_batch_write
    }

    /// Write every record, returning how many were stored.
    pub async fn write(&self, granularity: Granularity, records: Vec<AggregatedRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let chunks = into_chunks(records, self.max_batch_write);
        tracing::debug!(
            "Writing {} chunks to {}",
            chunks.len(),
            self.store.table_name(granularity)
        );

        let results = join_all(
            chunks
                .into_iter()
                .map(|chunk| self.write_chunk(granularity, chunk)),
        )
        .await;

        let mut written = 0;
        for result in results {
            written += result?;
        }
        Ok(written)
    }

    /// No backoff and no retry limit: throttled items are resubmitted
    /// immediately until the store accepts them all.
    async fn write_chunk(&self, granularity: Granularity, mut chunk: Vec<AggregatedRecord>) -> Result<usize> {
        let mut written = 0;
        loop {
            let outcome = self.store.batch_write(granularity, chunk).await?;
            written += outcome.written;
            if outcome.is_complete() {
                return Ok(written);
            }
            tracing::debug!(
                "Resubmitting {} unprocessed items to {}",
                outcome.unprocessed.len(),
                self.store.table_name(granularity)
            );
            chunk = outcome.unprocessed;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
