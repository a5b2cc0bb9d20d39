//! Result consolidation: per-chunk outcomes merged into the final report.

use super::chunk::{Chunk, ChunkId};
use super::metrics::MetricsSnapshot;
use super::state::ProcessingState;
use super::worker_pool::WorkerOutput;
use crate::extract::Consolidate;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Terminal outcome of one chunk. Stored once and never changed.
#[derive(Debug, Clone)]
pub struct ChunkResult<T> {
    pub chunk_id: ChunkId,
    pub index: usize,
    pub offset: u64,
    pub size: usize,
    pub success: bool,
    pub data: Option<T>,
    pub processing_time: Duration,
    pub attempts: u32,
    pub worker_id: Option<usize>,
    /// Error of every failed attempt, oldest first
    pub errors: Vec<String>,
}

/// Per-chunk line of the final report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkSummary {
    pub chunk_id: ChunkId,
    pub index: usize,
    pub offset: u64,
    pub size: usize,
    pub success: bool,
    pub attempts: u32,
    pub processing_time_ms: u64,
    pub worker_id: Option<usize>,
}

/// Aggregate numbers of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingInfo {
    pub total_chunks: usize,
    pub successful_chunks: usize,
    pub failed_chunks: usize,
    /// Wall time of the whole run
    #[serde(rename = "total_processing_time_ms", serialize_with = "as_millis")]
    pub total_processing_time: Duration,
    /// Mean size of all chunks, in bytes
    pub average_chunk_size: usize,
    /// Bytes per second
    pub peak_throughput: f64,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Final output of a run.
#[derive(Debug, Clone)]
pub struct PipelineReport<T> {
    /// True when no chunk failed permanently
    pub success: bool,
    /// Successful outputs merged in chunk order
    pub data: T,
    pub metrics: MetricsSnapshot,
    pub processing_info: ProcessingInfo,
    /// One entry per failed chunk
    pub errors: Vec<String>,
    pub chunks: Vec<ChunkSummary>,
    /// Chunk size the adaptive controller settled on
    pub recommended_chunk_size: usize,
    pub state: ProcessingState,
}

/// Collects chunk results as they arrive, in any order.
#[derive(Debug)]
pub struct ResultConsolidator<T> {
    results: BTreeMap<usize, ChunkResult<T>>,
    succeeded: HashSet<ChunkId>,
}

impl<T> Default for ResultConsolidator<T> {
    fn default() -> Self {
        Self {
            results: BTreeMap::new(),
            succeeded: HashSet::new(),
        }
    }
}

impl<T: Consolidate> ResultConsolidator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a successful result. Returns false if the chunk already has one.
    pub fn record_success(&mut self, chunk: &Chunk, output: WorkerOutput<T>) -> bool {
        let result = ChunkResult {
            chunk_id: chunk.id(),
            index: chunk.index(),
            offset: chunk.offset(),
            size: chunk.size(),
            success: true,
            data: Some(output.output),
            processing_time: output.elapsed,
            attempts: chunk.retry_count() + 1,
            worker_id: Some(output.worker_id),
            errors: chunk.attempt_errors().to_vec(),
        };
        if self.insert(result) {
            self.succeeded.insert(chunk.id());
            true
        } else {
            false
        }
    }

    /// Store a permanent failure. Returns false if the chunk already has a result.
    pub fn record_failure(&mut self, chunk: &Chunk) -> bool {
        self.insert(ChunkResult {
            chunk_id: chunk.id(),
            index: chunk.index(),
            offset: chunk.offset(),
            size: chunk.size(),
            success: false,
            data: None,
            processing_time: chunk.last_attempt_time(),
            attempts: chunk.retry_count(),
            worker_id: None,
            errors: chunk.attempt_errors().to_vec(),
        })
    }

    fn insert(&mut self, result: ChunkResult<T>) -> bool {
        if self.results.contains_key(&result.index) {
            tracing::warn!("Ignoring duplicate result for {}", result.chunk_id);
            return false;
        }
        self.results.insert(result.index, result);
        true
    }

    /// Whether `id` has a stored successful result.
    pub fn succeeded(&self, id: ChunkId) -> bool {
        self.succeeded.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ChunkResult<T>> {
        self.results.get(&index)
    }

    /// Drop every stored result.
    pub fn discard(&mut self) {
        self.results.clear();
        self.succeeded.clear();
    }

    /// Merge all results into the report.
    ///
    /// Outputs are merged in ascending chunk index regardless of completion
    /// order. `success` is true only when no chunk failed.
    pub fn finish(
        self,
        state: ProcessingState,
        metrics: MetricsSnapshot,
        total_processing_time: Duration,
        recommended_chunk_size: usize,
    ) -> PipelineReport<T> {
        let total_chunks = self.results.len();
        let mut parts = Vec::with_capacity(total_chunks);
        let mut chunks = Vec::with_capacity(total_chunks);
        let mut errors = Vec::new();
        let mut total_bytes = 0u64;

        for result in self.results.into_values() {
            total_bytes += result.size as u64;
            chunks.push(ChunkSummary {
                chunk_id: result.chunk_id,
                index: result.index,
                offset: result.offset,
                size: result.size,
                success: result.success,
                attempts: result.attempts,
                processing_time_ms: result.processing_time.as_millis() as u64,
                worker_id: result.worker_id,
            });
            match result.data {
                Some(data) => parts.push(data),
                None => errors.push(format!(
                    "{} failed after {} attempts: {}",
                    result.chunk_id,
                    result.attempts,
                    result.errors.last().map(String::as_str).unwrap_or("unknown error")
                )),
            }
        }

        let failed_chunks = errors.len();
        let processing_info = ProcessingInfo {
            total_chunks,
            successful_chunks: total_chunks - failed_chunks,
            failed_chunks,
            total_processing_time,
            average_chunk_size: if total_chunks > 0 {
                (total_bytes / total_chunks as u64) as usize
            } else {
                0
            },
            peak_throughput: metrics.peak_throughput,
        };

        PipelineReport {
            success: failed_chunks == 0,
            data: T::consolidate(parts),
            metrics,
            processing_info,
            errors,
            chunks,
            recommended_chunk_size,
            state,
        }
    }
}
