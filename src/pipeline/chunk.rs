//! Chunk model: a contiguous byte range of the input scheduled as one unit of work.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Identifier of a chunk within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChunkId(u64);

impl ChunkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{}", self.0)
    }
}

/// Per-chunk metadata handed to the extractor alongside the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkMetadata {
    /// Position of the chunk in the final ordering
    pub index: usize,
    /// Byte offset of the chunk in the input
    pub offset: u64,
    /// Chunk length in bytes
    pub size: usize,
    /// Total input length in bytes
    pub total_size: u64,
    /// 1-based attempt number for this dispatch
    pub attempt: u32,
    /// Whether this is the last chunk of the input
    pub is_last: bool,
}

/// Lifecycle state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Running,
    RetryPending,
    Completed,
    Failed,
}

/// A contiguous byte range of the input.
///
/// `offset`, `size` and `index` are fixed at creation; only the retry count,
/// attempt errors and lifecycle state change while the chunk moves through the scheduler.
#[derive(Debug, Clone)]
pub struct Chunk {
    id: ChunkId,
    index: usize,
    offset: u64,
    size: usize,
    payload: Bytes,
    total_size: u64,
    pub(crate) retry_count: u32,
    pub(crate) state: ChunkState,
    pub(crate) dependencies: Vec<ChunkId>,
    pub(crate) attempt_errors: Vec<String>,
    pub(crate) last_attempt_time: Duration,
}

impl Chunk {
    /// Cut a chunk out of `input`. `payload` is a zero-copy slice.
    pub(crate) fn new(index: usize, offset: u64, size: usize, input: &Bytes) -> Self {
        let start = offset as usize;
        Self {
            id: ChunkId::new(index as u64),
            index,
            offset,
            size,
            payload: input.slice(start..start + size),
            total_size: input.len() as u64,
            retry_count: 0,
            state: ChunkState::Pending,
            dependencies: Vec::new(),
            attempt_errors: Vec::new(),
            last_attempt_time: Duration::ZERO,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn dependencies(&self) -> &[ChunkId] {
        &self.dependencies
    }

    /// Error messages of failed attempts, oldest first.
    /// Wall time of the most recent attempt, from dispatch to outcome.
    pub fn last_attempt_time(&self) -> Duration {
        self.last_attempt_time
    }

    pub fn attempt_errors(&self) -> &[String] {
        &self.attempt_errors
    }

    /// Metadata for the next attempt.
    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            index: self.index,
            offset: self.offset,
            size: self.size,
            total_size: self.total_size,
            attempt: self.retry_count + 1,
            is_last: self.end() == self.total_size,
        }
    }
}
