//! Rollup Streaming Transport
//!
//! Pull-based partitioned stream interface and its in-memory
//! implementation. Records are routed to shards by partition key; a
//! consumer reads a shard through an opaque cursor that only moves forward.
//!
//! Key Features:
//! - Shard listing, latest-position cursors and bounded reads
//! - One shard per granularity so each shard feeds one table
//! - Closed shards report no further cursor once drained
//! - Bounded per-shard retention
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rollup_common::utils::partition_for;
use rollup_common::{Granularity, Result, RollupError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_RETAINED_RECORDS: usize = 1_000_000;

// =============================================================================
// Records and Cursors
// =============================================================================

/// Position in one shard. Opaque to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCursor {
    shard: String,
    position: u64,
}

impl ShardCursor {
    pub fn shard(&self) -> &str {
        &self.shard
    }
}

impl fmt::Display for ShardCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.shard, self.position)
    }
}

/// A record read from a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub sequence: u64,
    pub partition_key: String,
    pub data: Bytes,
}

/// A record to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRecord {
    pub partition_key: String,
    pub data: Bytes,
}

impl OutgoingRecord {
    pub fn new(partition_key: impl Into<String>, data: Bytes) -> Self {
        Self {
            partition_key: partition_key.into(),
            data,
        }
    }
}

/// Result of one read.
#[derive(Debug, Clone, Default)]
pub struct GetRecordsOutput {
    pub records: Vec<StreamRecord>,
    /// `None` once the shard is closed and fully read.
    pub next_cursor: Option<ShardCursor>,
}

// =============================================================================
// Stream Transport Trait
// =============================================================================

/// A partitioned, pull-based event stream.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn list_shards(&self) -> Result<Vec<String>>;

    /// Cursor positioned after the last record currently in `shard`.
    async fn latest_cursor(&self, shard: &str) -> Result<ShardCursor>;

    /// Read up to `limit` records from `cursor`.
    async fn get_records(&self, cursor: &ShardCursor, limit: usize) -> Result<GetRecordsOutput>;

    /// Publish records, returning how many were accepted.
    async fn put_records(&self, records: Vec<OutgoingRecord>) -> Result<usize>;
}

// =============================================================================
// Memory Transport
// =============================================================================

#[derive(Default)]
struct ShardLog {
    /// Sequence number of `records[0]`.
    base: u64,
    records: VecDeque<StreamRecord>,
    closed: bool,
}

impl ShardLog {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }
}

/// In-memory partitioned stream.
pub struct MemoryTransport {
    stream_name: String,
    names: Vec<String>,
    shards: Vec<RwLock<ShardLog>>,
    retained_records: usize,
    pending_read_failures: AtomicU64,
}

impl MemoryTransport {
    /// A stream with one shard per granularity.
    pub fn per_granularity(stream_name: impl Into<String>) -> Self {
        let names = Granularity::ALL
            .iter()
            .map(|g| format!("shard-{}", g))
            .collect();
        Self::with_shards(stream_name, names)
    }

    pub fn with_shards(stream_name: impl Into<String>, shard_names: Vec<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            shards: shard_names.iter().map(|_| RwLock::default()).collect(),
            names: shard_names,
            retained_records: DEFAULT_RETAINED_RECORDS,
            pending_read_failures: AtomicU64::new(0),
        }
    }

    /// Keep at most `records` per shard, dropping the oldest.
    pub fn with_retention(mut self, records: usize) -> Self {
        self.retained_records = records.max(1);
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Close a shard: its readers drain what is left, then stop.
    pub fn close_shard(&self, shard: &str) -> Result<()> {
        let index = self.shard_index(shard)?;
        self.shards[index].write().closed = true;
        Ok(())
    }

    pub fn close_all(&self) {
        for shard in &self.shards {
            shard.write().closed = true;
        }
    }

    /// Records currently held by `shard`.
    pub fn pending(&self, shard: &str) -> Result<usize> {
        let index = self.shard_index(shard)?;
        let len = self.shards[index].read().records.len();
        Ok(len)
    }

    /// Make the next `count` reads fail with a transport error.
    pub fn fail_next_reads(&self, count: u64) {
        self.pending_read_failures.store(count, Ordering::SeqCst);
    }

    fn shard_index(&self, shard: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|name| name == shard)
            .ok_or_else(|| RollupError::ShardNotFound(shard.to_string()))
    }

    /// Granularity keys map onto their own shard when one exists.
    fn route(&self, partition_key: &str) -> usize {
        let named = format!("shard-{}", partition_key);
        self.names
            .iter()
            .position(|name| *name == named)
            .unwrap_or_else(|| partition_for(partition_key, self.names.len()))
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn list_shards(&self) -> Result<Vec<String>> {
        Ok(self.names.clone())
    }

    async fn latest_cursor(&self, shard: &str) -> Result<ShardCursor> {
        let index = self.shard_index(shard)?;
        let position = self.shards[index].read().end();
        Ok(ShardCursor {
            shard: shard.to_string(),
            position,
        })
    }

    async fn get_records(&self, cursor: &ShardCursor, limit: usize) -> Result<GetRecordsOutput> {
        let injected = self
            .pending_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RollupError::Transport(format!(
                "injected read failure on {}",
                cursor.shard
            )));
        }

        let index = self.shard_index(&cursor.shard)?;
        let log = self.shards[index].read();

        // Reads behind the retention horizon resume at the oldest record.
        let start = cursor.position.max(log.base);
        let skip = (start - log.base) as usize;
        let records: Vec<StreamRecord> = log.records.iter().skip(skip).take(limit).cloned().collect();
        let position = start + records.len() as u64;

        let next_cursor = if log.closed && position >= log.end() {
            None
        } else {
            Some(ShardCursor {
                shard: cursor.shard.clone(),
                position,
            })
        };

        Ok(GetRecordsOutput {
            records,
            next_cursor,
        })
    }

    async fn put_records(&self, records: Vec<OutgoingRecord>) -> Result<usize> {
        if self.names.is_empty() {
            return Err(RollupError::Transport(format!(
                "stream {} has no shards",
                self.stream_name
            )));
        }
        let mut accepted = 0;
        for record in records {
            let index = self.route(&record.partition_key);
            let mut log = self.shards[index].write();
            if log.closed {
                return Err(RollupError::Transport(format!(
                    "shard {} is closed",
                    self.names[index]
                )));
            }
            let sequence = log.end();
            log.records.push_back(StreamRecord {
                sequence,
                partition_key: record.partition_key,
                data: record.data,
            });
            while log.records.len() > self.retained_records {
                log.records.pop_front();
                log.base += 1;
            }
            accepted += 1;
        }
        Ok(accepted)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, body: &'static str) -> OutgoingRecord {
        OutgoingRecord::new(key, Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn test_routing_by_granularity() {
        let transport = MemoryTransport::per_granularity("ts_stream");
        let shards = transport.list_shards().await.unwrap();
        assert_eq!(shards.len(), 6);

        transport
            .put_records(vec![record("hour", "a"), record("hour", "b"), record("day", "c")])
            .await
            .expect("put_records should succeed");

        assert_eq!(transport.pending("shard-hour").unwrap(), 2);
        assert_eq!(transport.pending("shard-day").unwrap(), 1);
        assert_eq!(transport.pending("shard-minute").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_latest_cursor_skips_existing_records() {
        let transport = MemoryTransport::per_granularity("ts_stream");
        transport.put_records(vec![record("minute", "old")]).await.unwrap();

        let cursor = transport.latest_cursor("shard-minute").await.unwrap();
        transport.put_records(vec![record("minute", "new")]).await.unwrap();

        let output = transport.get_records(&cursor, 10).await.unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].data, Bytes::from_static(b"new"));

        let next = output.next_cursor.unwrap();
        let empty = transport.get_records(&next, 10).await.unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.next_cursor, Some(next));
    }

    #[tokio::test]
    async fn test_limit_and_close() {
        let transport = MemoryTransport::per_granularity("ts_stream");
        let cursor = transport.latest_cursor("shard-year").await.unwrap();
        transport
            .put_records(vec![record("year", "1"), record("year", "2"), record("year", "3")])
            .await
            .unwrap();
        transport.close_shard("shard-year").unwrap();

        let first = transport.get_records(&cursor, 2).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let cursor = first.next_cursor.expect("records remain");

        let second = transport.get_records(&cursor, 2).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(second.next_cursor.is_none());

        assert!(transport.put_records(vec![record("year", "4")]).await.is_err());
    }

    #[tokio::test]
    async fn test_retention_horizon() {
        let transport = MemoryTransport::with_shards("s", vec!["only".into()]).with_retention(2);
        let cursor = transport.latest_cursor("only").await.unwrap();
        transport
            .put_records(vec![record("k", "1"), record("k", "2"), record("k", "3")])
            .await
            .unwrap();

        let output = transport.get_records(&cursor, 10).await.unwrap();
        let sequences: Vec<_> = output.records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_errors() {
        let transport = MemoryTransport::per_granularity("ts_stream");
        assert!(matches!(
            transport.latest_cursor("shard-week").await,
            Err(RollupError::ShardNotFound(_))
        ));

        let cursor = transport.latest_cursor("shard-hour").await.unwrap();
        transport.fail_next_reads(1);
        let err = transport.get_records(&cursor, 1).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.get_records(&cursor, 1).await.is_ok());
    }
}
