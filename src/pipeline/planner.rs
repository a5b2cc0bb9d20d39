//! Chunk planning: boundaries and sizes from input length and memory budget.
//!
//! The planner cuts the input sequentially from a cursor. In static mode the
//! scheduler drains it up-front with the computed optimal size; in incremental
//! mode it cuts each chunk on demand with whatever size the adaptive
//! controller currently recommends. Either way the chunks partition
//! `[0, total_size)` exactly.

use super::chunk::Chunk;
use bytes::Bytes;
use serde::Serialize;

/// Inputs to the optimal chunk size computation.
#[derive(Debug, Clone, Copy)]
pub struct PlanParams {
    /// Estimated memory available to the run in bytes (0 = unknown)
    pub available_memory: u64,
    /// Number of chunks held in memory concurrently
    pub concurrency: usize,
    /// Fraction of available memory the run may use
    pub memory_threshold: f64,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Used when no memory estimate is available
    pub fallback_chunk_size: usize,
}

/// `clamp(available * threshold / concurrency, min, max)`.
pub fn optimal_chunk_size(params: &PlanParams) -> usize {
    let raw = if params.available_memory == 0 {
        params.fallback_chunk_size as f64
    } else {
        params.available_memory as f64 * params.memory_threshold / params.concurrency.max(1) as f64
    };

    let size = if raw.is_finite() && raw > 0.0 {
        raw.min(usize::MAX as f64) as usize
    } else {
        params.min_chunk_size
    };
    size.clamp(params.min_chunk_size, params.max_chunk_size).max(1)
}

/// Sequential chunk cutter over the input buffer.
pub struct ChunkPlanner {
    input: Bytes,
    cursor: u64,
    next_index: usize,
    chunk_size: usize,
}

impl ChunkPlanner {
    /// Create a planner cutting `input` into chunks of `chunk_size` by default.
    pub fn new(input: Bytes, chunk_size: usize) -> Self {
        Self {
            input,
            cursor: 0,
            next_index: 0,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.input.len() as u64
    }

    /// Size the planner uses when no explicit size is given.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks cut so far.
    pub fn planned(&self) -> usize {
        self.next_index
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total_size() - self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.total_size()
    }

    /// Chunks a full static plan produces: `ceil(total / chunk_size)`.
    pub fn estimated_total(&self) -> usize {
        (self.total_size() as usize).div_ceil(self.chunk_size)
    }

    /// Cut the next chunk of at most `size` bytes.
    pub fn next_chunk(&mut self, size: usize) -> Option<Chunk> {
        if self.is_exhausted() {
            return None;
        }
        let size = (size.max(1) as u64).min(self.remaining_bytes()) as usize;
        let chunk = Chunk::new(self.next_index, self.cursor, size, &self.input);
        self.cursor += size as u64;
        self.next_index += 1;
        Some(chunk)
    }

    /// Cut all remaining input with the default chunk size.
    pub fn plan_all(&mut self) -> Vec<Chunk> {
        let mut chunks = Vec::with_capacity(self.estimated_total());
        while let Some(chunk) = self.next_chunk(self.chunk_size) {
            chunks.push(chunk);
        }
        chunks
    }

    /// Describe the static plan without cutting anything.
    pub fn summary(&self) -> PlanSummary {
        PlanSummary::new(self.total_size(), self.chunk_size)
    }
}

/// Summary of a static plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub total_size: u64,
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub last_chunk_size: u64,
}

impl PlanSummary {
    /// Static plan of `total_size` bytes cut into `chunk_size` pieces.
    pub fn new(total_size: u64, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let last_chunk_size = match total_size % chunk_size as u64 {
            0 if total_size > 0 => chunk_size as u64,
            rem => rem,
        };
        Self {
            total_size,
            chunk_size,
            chunk_count: total_size.div_ceil(chunk_size as u64) as usize,
            last_chunk_size,
        }
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Input: {} bytes, Chunk size: {} bytes, Chunks: {}, Last chunk: {} bytes",
            self.total_size, self.chunk_size, self.chunk_count, self.last_chunk_size
        )
    }
}
