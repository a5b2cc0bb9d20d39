//! Typed pipeline events for progress consumers.

use super::chunk::ChunkId;
use super::state::ProcessingState;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why dispatch was paused or resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// `PipelineHandle::pause` / `resume`
    User,
    /// Memory pressure crossed the threshold
    Backpressure,
}

/// Events emitted by a run, in the order the coordinating loop observed them.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Planning finished and processing is about to start
    Prepared {
        total_size: u64,
        chunks_total: usize,
        chunk_size: usize,
        incremental: bool,
    },
    /// A chunk attempt was dispatched to a worker
    ChunkStarted {
        chunk_id: ChunkId,
        index: usize,
        offset: u64,
        size: usize,
        attempt: u32,
    },
    /// A chunk succeeded
    ChunkCompleted {
        chunk_id: ChunkId,
        index: usize,
        processing_time: Duration,
        worker_id: usize,
    },
    /// A chunk attempt failed and will be retried after `delay`
    ChunkRetry {
        chunk_id: ChunkId,
        retry_count: u32,
        delay: Duration,
        error: String,
    },
    /// A chunk exhausted its retries
    ChunkFailed {
        chunk_id: ChunkId,
        attempts: u32,
        error: String,
    },
    /// Memory pressure rose above the threshold
    BackpressureDetected { pressure: f64, threshold: f64 },
    Paused { reason: PauseReason },
    Resumed { reason: PauseReason },
    /// The adaptive controller changed the chunk size for future chunks
    ChunkSizeAdjusted { previous: usize, current: usize },
    /// A worker context was discarded and recreated
    WorkerReplaced { worker_id: usize, generation: u64 },
    /// Periodic progress snapshot
    Progress(ProcessingState),
    Cancelled,
    /// All chunks reached a terminal state
    Completed {
        success: bool,
        successful_chunks: usize,
        failed_chunks: usize,
    },
}

impl PipelineEvent {
    /// Short kebab-case name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prepared { .. } => "prepared",
            Self::ChunkStarted { .. } => "chunk-processing-started",
            Self::ChunkCompleted { .. } => "chunk-processing-completed",
            Self::ChunkRetry { .. } => "chunk-retry",
            Self::ChunkFailed { .. } => "chunk-processing-failed",
            Self::BackpressureDetected { .. } => "backpressure-detected",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::ChunkSizeAdjusted { .. } => "chunk-size-adjusted",
            Self::WorkerReplaced { .. } => "worker-replaced",
            Self::Progress(_) => "progress",
            Self::Cancelled => "cancelled",
            Self::Completed { .. } => "completed",
        }
    }
}

/// Fan-out of events to every live subscriber.
///
/// Subscribers get unbounded channels so a slow consumer never stalls the
/// coordinating loop; closed subscribers are pruned on the next emit.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn emit(&mut self, event: PipelineEvent) {
        tracing::trace!("event: {}", event.name());
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
