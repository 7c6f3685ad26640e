//! Rollup Utils - Utility Functions
//!
//! Small helpers shared across the pipeline crates.
//!
//! Key Features:
//! - Fast hashing using xxHash3 for partition routing
//! - Fixed-size chunking for batched writes
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use xxhash_rust::xxh3::xxh3_64;

// =============================================================================
// Hashing Functions
// =============================================================================

/// Compute a 64-bit hash of the given bytes using xxHash3.
#[inline]
pub fn hash64(data: &[u8]) -> u64 {
    xxh3_64(data)
}

/// Pick one of `partitions` slots for a routing key.
#[inline]
pub fn partition_for(key: &str, partitions: usize) -> usize {
    if partitions == 0 {
        return 0;
    }
    (hash64(key.as_bytes()) % partitions as u64) as usize
}

// =============================================================================
// Batching
// =============================================================================

/// Split `items` into owned chunks of at most `size` elements.
pub fn into_chunks<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// =============================================================================
// Tests
// =============================================================================
