//! Chunked processing pipeline.
//!
//! Planning, dependency-aware scheduling, the worker pool, backpressure,
//! adaptive sizing, metrics and result consolidation.

mod adaptive;
mod backpressure;
mod chunk;
mod consolidate;
mod control;
mod dependency;
mod events;
mod metrics;
mod planner;
mod queue;
mod scheduler;
mod state;
mod worker_pool;

#[cfg(test)]
mod scheduler_integration_tests;

pub use adaptive::AdaptiveSizer;
pub use backpressure::{
    BackpressureMonitor, ManualMemoryProbe, MemoryProbe, PressureTransition, SystemMemoryProbe,
};
pub use chunk::{Chunk, ChunkId, ChunkMetadata, ChunkState};
pub use consolidate::{ChunkResult, ChunkSummary, PipelineReport, ProcessingInfo, ResultConsolidator};
pub use control::PipelineHandle;
pub use dependency::DependencyResolver;
pub use events::{EventBus, PauseReason, PipelineEvent};
pub use metrics::{Metrics, MetricsAggregator, MetricsReporter, MetricsSnapshot, ThroughputSample};
pub use planner::{optimal_chunk_size, ChunkPlanner, PlanParams, PlanSummary};
pub use queue::TaskQueue;
pub(crate) use scheduler::Scheduler;
pub use state::{ProcessingState, RunStatus};
pub use worker_pool::{Ticket, WorkerOutput, WorkerPool, WorkerPoolConfig, WorkerReplacement};

pub(crate) use control::Command;
pub(crate) use scheduler::RunChannels;
