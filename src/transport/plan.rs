//! Deterministic chunk planning
//!
//! The plan is a pure function of file size and the platform part-size
//! limit: `ceil(size / limit)` chunks whose offsets partition `[0, size)`
//! with no gaps or overlaps.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ChunkToken;

/// Transfer status of a single chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// Not yet dispatched
    Pending,
    /// Currently transferring
    InFlight,
    /// Acknowledged by the platform
    Acknowledged,
    /// Exhausted its retries
    Failed,
}

/// One contiguous byte range transferred as a single platform part
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// 0-based, contiguous sequence index
    pub index: u32,
    /// Byte offset into the file
    pub offset: u64,
    /// Byte length (always <= the platform limit)
    pub len: u64,
    /// Upload token returned by the platform on success
    pub token: Option<ChunkToken>,
    /// Transfer status
    pub status: ChunkStatus,
}

/// Ordered chunk plan for one file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    chunks: Vec<ChunkDescriptor>,
    total_size: u64,
    limit: u64,
}

impl ChunkPlan {
    /// Compute the plan for a file of `total_size` bytes under `limit`
    ///
    /// Errors with a configuration error when the limit is zero. An empty
    /// file produces an empty plan.
    pub fn compute(total_size: u64, limit: u64) -> Result<Self> {
        if limit == 0 {
            return Err(Error::Config {
                message: "chunk size limit must be greater than zero".to_string(),
                key: Some("transport.chunk_size".to_string()),
            });
        }

        let count = total_size.div_ceil(limit);
        let mut chunks = Vec::with_capacity(count as usize);
        for index in 0..count {
            let offset = index * limit;
            let len = limit.min(total_size - offset);
            chunks.push(ChunkDescriptor {
                index: index as u32,
                offset,
                len,
                token: None,
                status: ChunkStatus::Pending,
            });
        }

        Ok(Self {
            chunks,
            total_size,
            limit,
        })
    }

    /// The planned chunks, ordered by sequence index
    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    /// Number of chunks in the plan
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the plan is empty (zero-byte file)
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total size the plan covers
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// The part-size limit the plan was computed against
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

/// Buffers out-of-order chunk completions and releases tokens strictly in
/// ascending sequence order.
///
/// The platform's finalize call must receive tokens in ascending index
/// order even when network completion order differs; the collector only
/// advances its next-expected pointer when the matching completion arrives.
#[derive(Debug, Default)]
pub struct OrderedTokenCollector {
    next_expected: u32,
    pending: std::collections::BTreeMap<u32, ChunkToken>,
    committed: Vec<ChunkToken>,
}

impl OrderedTokenCollector {
    /// Create an empty collector expecting index 0 first
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed chunk; out-of-order completions are buffered
    pub fn push(&mut self, index: u32, token: ChunkToken) {
        self.pending.insert(index, token);
        while let Some(token) = self.pending.remove(&self.next_expected) {
            self.committed.push(token);
            self.next_expected += 1;
        }
    }

    /// Tokens committed so far, in ascending sequence order
    pub fn committed(&self) -> &[ChunkToken] {
        &self.committed
    }

    /// Consume the collector, returning the ordered tokens
    ///
    /// Returns `None` if any expected completion is still missing.
    pub fn finish(self, expected: usize) -> Option<Vec<ChunkToken>> {
        if self.committed.len() == expected && self.pending.is_empty() {
            Some(self.committed)
        } else {
            None
        }
    }
}
