//! Chunkflow
//!
//! Streaming pipeline that processes large inputs as a sequence of byte-range
//! chunks with bounded memory and bounded concurrency.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Planning**: chunk sizes derived from the memory budget, cut up-front or incrementally
//! - **Scheduling**: a priority queue with dependency resolution and retry backoff
//! - **Workers**: a fixed pool of extractor contexts, replaced when one crashes
//! - **Flow control**: memory backpressure, pause/resume and cancellation
//! - **Adaptive sizing**: future chunk sizes steered towards a target processing time
//! - **Reporting**: typed events, live state and metrics, and an ordered final report
//!
//! # Usage
//!
//! ```no_run
//! use chunkflow::{extractors::LineCounter, Config, StreamingPipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml".as_ref())?;
//!     let pipeline = StreamingPipeline::with_extractor(config, LineCounter);
//!     let report = pipeline.run_file("input.log").await?;
//!     println!("{} lines", report.data.newlines);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod extractors;
pub mod pipeline;

pub use config::{
    BackpressureConfig, ChunkingConfig, Config, DependencyPolicy, DependencyRule, MetricsConfig,
    ProcessingConfig, RetryConfig,
};
pub use error::{Error, ExtractError, Result};
pub use extract::{factory, from_fn, ChunkExtractor, Consolidate, ExtractorFactory};
pub use pipeline::{
    ChunkId, ChunkMetadata, MetricsSnapshot, PipelineEvent, PipelineHandle, PipelineReport,
    PlanSummary, ProcessingInfo, ProcessingState, RunStatus,
};

use bytes::Bytes;
use pipeline::{
    optimal_chunk_size, Command, EventBus, MemoryProbe, PlanParams, RunChannels, Scheduler,
    SystemMemoryProbe,
};
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A configured pipeline, ready to run once.
///
/// Subscribe to events and take control handles before calling
/// [`run`](Self::run); the run consumes the pipeline.
pub struct StreamingPipeline<E: ChunkExtractor> {
    config: Config,
    factory: ExtractorFactory<E>,
    probe: Arc<dyn MemoryProbe>,
    events: EventBus,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    state_tx: watch::Sender<ProcessingState>,
    metrics_tx: watch::Sender<MetricsSnapshot>,
    live_workers: Arc<AtomicUsize>,
}

impl<E: ChunkExtractor> StreamingPipeline<E> {
    /// Create a pipeline whose worker contexts are built by `factory`.
    pub fn new<F>(config: Config, factory: F) -> Self
    where
        F: Fn() -> std::result::Result<E, ExtractError> + Send + Sync + 'static,
    {
        let probe = Arc::new(SystemMemoryProbe::with_limit(
            config.backpressure.memory_limit_bytes,
        ));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ProcessingState::new(0, config.chunking.chunk_size));
        let (metrics_tx, _) = watch::channel(MetricsSnapshot::default());

        Self {
            config,
            factory: Arc::new(factory),
            probe,
            events: EventBus::new(),
            commands_tx,
            commands_rx,
            cancel: CancellationToken::new(),
            state_tx,
            metrics_tx,
            live_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a pipeline whose worker contexts are clones of `extractor`.
    pub fn with_extractor(config: Config, extractor: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::new(config, move || Ok(extractor.clone()))
    }

    /// Replace the system memory probe.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Receive every event of the run.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Handle to control and observe the run.
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle::new(
            self.commands_tx.clone(),
            self.cancel.clone(),
            self.state_tx.subscribe(),
            self.metrics_tx.subscribe(),
            self.live_workers.clone(),
        )
    }

    /// Plan `total_size` bytes with the current memory estimate, without
    /// processing anything.
    pub fn plan(&self, total_size: u64) -> PlanSummary {
        let chunking = &self.config.chunking;
        let chunk_size = optimal_chunk_size(&PlanParams {
            available_memory: self.probe.available_bytes(),
            concurrency: self.config.processing.concurrent_chunks,
            memory_threshold: self.config.backpressure.memory_threshold,
            min_chunk_size: chunking.min_chunk_size,
            max_chunk_size: chunking.max_chunk_size,
            fallback_chunk_size: chunking.chunk_size,
        });
        PlanSummary::new(total_size, chunk_size)
    }

    /// Process `input` and return the consolidated report.
    ///
    /// Chunk failures are reported in [`PipelineReport::errors`]; the call
    /// only fails on invalid configuration, failed initialization, loss of
    /// every worker context, or cancellation.
    pub async fn run(self, input: impl Into<Bytes>) -> Result<PipelineReport<E::Output>> {
        let input = input.into();
        let Self {
            config,
            factory,
            probe,
            events,
            commands_tx,
            commands_rx,
            cancel,
            state_tx,
            metrics_tx,
            live_workers,
        } = self;
        drop(commands_tx);

        if let Err(e) = config.validate() {
            state_tx.send_modify(|s| s.status = RunStatus::Failed);
            return Err(Error::config(e.to_string()));
        }

        tracing::info!("Starting pipeline over {} bytes", input.len());

        let scheduler = Scheduler::new(
            Arc::new(config),
            input,
            probe,
            factory,
            live_workers,
            RunChannels {
                events,
                commands: commands_rx,
                cancel,
                state: state_tx.clone(),
                metrics: metrics_tx,
            },
        );

        match scheduler {
            Ok(scheduler) => scheduler.run().await,
            Err(e) => {
                tracing::error!("Pipeline initialization failed: {}", e);
                state_tx.send_modify(|s| s.status = RunStatus::Failed);
                Err(e)
            }
        }
    }

    /// Read `path` and process its contents.
    pub async fn run_file(self, path: impl AsRef<Path>) -> Result<PipelineReport<E::Output>> {
        let path = path.as_ref();
        let input = tokio::fs::read(path).await.map_err(|e| {
            Error::initialization(format!("cannot read {}: {}", path.display(), e))
        })?;
        tracing::info!("Loaded {} ({} bytes)", path.display(), input.len());
        self.run(input).await
    }
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
