//! Deterministic mapping from session id to partition index.
//!
//! The hash is taken from SHA-256 so the mapping is identical in every
//! process and across restarts. The signed 32-bit hash range is split into
//! `partition_count` equal-width buckets.

use sha2::{Digest, Sha256};

/// Stable 32-bit hash of a session id.
pub fn session_hash(session_id: &str) -> i32 {
    let digest = Sha256::digest(session_id.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Partition index for `session_id`, always in `[0, partition_count)`.
///
/// A partition count of 0 is treated as 1.
pub fn route(session_id: &str, partition_count: usize) -> usize {
    let count = partition_count.max(1) as u64;
    // Offset of the hash from i32::MIN, in [0, 2^32).
    let offset = (i64::from(session_hash(session_id)) - i64::from(i32::MIN)) as u64;
    let index = (offset * count) >> 32;
    index.min(count - 1) as usize
}

/// Router bound to a fixed partition count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRouter {
    partition_count: usize,
}

impl PartitionRouter {
    pub fn new(partition_count: usize) -> Self {
        Self {
            partition_count: partition_count.max(1),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub fn route(&self, session_id: &str) -> usize {
        route(session_id, self.partition_count)
    }
}
