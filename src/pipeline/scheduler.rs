//! Coordinating loop for a pipeline run.
//!
//! A single task owns the queue, the processing state, the adaptive sizer and
//! the result store, so none of them need locks. Each round it:
//!
//! 1. honours cancellation and pause/resume commands,
//! 2. promotes retries whose backoff has elapsed,
//! 3. cuts more chunks (incremental mode),
//! 4. samples memory pressure,
//! 5. dispatches chunks while a worker slot is free and nothing gates dispatch,
//!
//! and then sleeps until a completion, a command, a retry deadline, a
//! progress tick or the next pressure poll wakes it up.

use super::adaptive::AdaptiveSizer;
use super::backpressure::{BackpressureMonitor, MemoryProbe, PressureTransition};
use super::chunk::{Chunk, ChunkState};
use super::consolidate::{PipelineReport, ResultConsolidator};
use super::control::Command;
use super::dependency::DependencyResolver;
use super::events::{EventBus, PauseReason, PipelineEvent};
use super::metrics::{Metrics, MetricsAggregator, MetricsReporter, MetricsSnapshot};
use super::planner::{optimal_chunk_size, ChunkPlanner, PlanParams};
use super::queue::TaskQueue;
use super::state::{ProcessingState, RunStatus};
use super::worker_pool::{WorkerOutput, WorkerPool, WorkerPoolConfig, WorkerReplacement};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::extract::{ChunkExtractor, ExtractorFactory};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

type InFlight<T> = FuturesUnordered<BoxFuture<'static, (Chunk, Result<WorkerOutput<T>>)>>;

/// Channels connecting a run to its observers and controllers.
pub(crate) struct RunChannels {
    pub events: EventBus,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub cancel: CancellationToken,
    pub state: watch::Sender<ProcessingState>,
    pub metrics: watch::Sender<MetricsSnapshot>,
}

/// Drives one run from planning to the consolidated report.
pub struct Scheduler<E: ChunkExtractor> {
    config: Arc<Config>,
    pool: WorkerPool<E>,
    replacements: mpsc::UnboundedReceiver<WorkerReplacement>,
    planner: ChunkPlanner,
    resolver: DependencyResolver,
    queue: TaskQueue,
    monitor: BackpressureMonitor,
    probe: Arc<dyn MemoryProbe>,
    sizer: AdaptiveSizer,
    aggregator: MetricsAggregator,
    consolidator: ResultConsolidator<E::Output>,
    metrics: Arc<Metrics>,
    state: ProcessingState,
    events: EventBus,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    cancel: CancellationToken,
    state_tx: watch::Sender<ProcessingState>,
    metrics_tx: watch::Sender<MetricsSnapshot>,
    user_paused: bool,
    started_at: Instant,
}

impl<E: ChunkExtractor> Scheduler<E> {
    /// Size the chunks and bring up the worker pool.
    ///
    /// Fails with [`Error::Initialization`] when the worker contexts cannot be
    /// built.
    pub(crate) fn new(
        config: Arc<Config>,
        input: Bytes,
        probe: Arc<dyn MemoryProbe>,
        factory: ExtractorFactory<E>,
        live_workers: Arc<AtomicUsize>,
        channels: RunChannels,
    ) -> Result<Self> {
        let chunking = &config.chunking;
        let concurrency = config.processing.concurrent_chunks;

        let chunk_size = optimal_chunk_size(&PlanParams {
            available_memory: probe.available_bytes(),
            concurrency,
            memory_threshold: config.backpressure.memory_threshold,
            min_chunk_size: chunking.min_chunk_size,
            max_chunk_size: chunking.max_chunk_size,
            fallback_chunk_size: chunking.chunk_size,
        });

        let metrics = Metrics::new();
        let (replaced_tx, replacements) = mpsc::unbounded_channel();
        let pool = WorkerPool::start(
            WorkerPoolConfig {
                size: concurrency,
                chunk_timeout: config.processing.chunk_timeout_ms.map(Duration::from_millis),
            },
            factory,
            metrics.clone(),
            live_workers,
            replaced_tx,
        )?;

        let state = ProcessingState::new(input.len() as u64, chunk_size);
        let mut aggregator = MetricsAggregator::new(config.metrics.history_limit);
        aggregator.record_chunk_size(chunk_size);

        Ok(Self {
            pool,
            replacements,
            planner: ChunkPlanner::new(input, chunk_size),
            resolver: DependencyResolver::new(
                chunking.dependencies.clone(),
                chunking.dependency_policy,
            ),
            queue: TaskQueue::new(),
            monitor: BackpressureMonitor::new(
                config.backpressure.memory_threshold,
                config.backpressure.resume_ratio,
            ),
            probe,
            sizer: AdaptiveSizer::new(
                chunk_size,
                chunking.min_chunk_size,
                chunking.max_chunk_size,
                Duration::from_millis(chunking.target_chunk_time_ms),
            ),
            aggregator,
            consolidator: ResultConsolidator::new(),
            metrics,
            state,
            events: channels.events,
            commands: channels.commands,
            commands_open: true,
            cancel: channels.cancel,
            state_tx: channels.state,
            metrics_tx: channels.metrics,
            user_paused: false,
            started_at: Instant::now(),
            config,
        })
    }

    /// Process every chunk and consolidate the results.
    ///
    /// Chunk failures end up in the report. Only cancellation and loss of
    /// every worker context return an error.
    pub async fn run(mut self) -> Result<PipelineReport<E::Output>> {
        match self.run_loop().await {
            Ok(()) => Ok(self.finish().await),
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.prepare()?;

        let mut in_flight: InFlight<E::Output> = FuturesUnordered::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.config.metrics.progress_interval_ms,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let cancel = self.cancel.clone();
        let idle_poll = Duration::from_millis(self.config.processing.idle_poll_ms);
        let pressure_poll = Duration::from_millis(self.config.backpressure.poll_interval_ms);

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            self.drain_replacements();
            self.queue.promote_due(Instant::now());
            self.refill()?;
            self.check_backpressure();
            self.dispatch(&mut in_flight)?;

            if in_flight.is_empty() && self.queue.is_drained() && self.planner.is_exhausted() {
                break;
            }

            let retry_at = self.queue.next_retry_deadline();
            let (poll_needed, poll) = if self.monitor.is_engaged() {
                (true, pressure_poll)
            } else {
                (in_flight.is_empty() && !self.queue.is_empty(), idle_poll)
            };

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(Error::Cancelled),

                command = self.commands.recv(), if self.commands_open => {
                    self.handle_command(command);
                }

                Some((chunk, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.handle_outcome(chunk, outcome);
                }

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {}

                _ = ticker.tick() => self.tick(),

                _ = tokio::time::sleep(poll), if poll_needed => {}
            }
        }

        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        let incremental = self.config.chunking.incremental;
        if incremental {
            self.refill()?;
        } else {
            for mut chunk in self.planner.plan_all() {
                self.resolver.assign(&mut chunk)?;
                self.queue.push_back(chunk);
            }
            self.state.chunks_total = self.planner.planned();
        }

        let summary = self.planner.summary();
        tracing::info!(
            "Scheduling {} chunks of {} bytes for processing ({} concurrent{})",
            summary.chunk_count,
            summary.chunk_size,
            self.config.processing.concurrent_chunks,
            if incremental { ", incremental" } else { "" }
        );

        self.state.status = RunStatus::Running;
        self.events.emit(PipelineEvent::Prepared {
            total_size: summary.total_size,
            chunks_total: summary.chunk_count,
            chunk_size: summary.chunk_size,
            incremental,
        });
        self.publish();
        Ok(())
    }

    /// Cut chunks on demand so at most one dispatch round is queued ahead.
    fn refill(&mut self) -> Result<()> {
        if !self.config.chunking.incremental {
            return Ok(());
        }
        let lookahead = self.config.processing.concurrent_chunks.max(1);
        while self.queue.len() < lookahead {
            let size = if self.config.chunking.enable_adaptive_chunking {
                self.sizer.current()
            } else {
                self.planner.chunk_size()
            };
            let Some(mut chunk) = self.planner.next_chunk(size) else {
                break;
            };
            self.resolver.assign(&mut chunk)?;
            self.queue.push_back(chunk);
            self.state.chunks_total += 1;
        }
        Ok(())
    }

    fn drain_replacements(&mut self) {
        while let Ok(replacement) = self.replacements.try_recv() {
            self.events.emit(PipelineEvent::WorkerReplaced {
                worker_id: replacement.worker_id,
                generation: replacement.generation,
            });
        }
    }

    fn check_backpressure(&mut self) {
        if !self.config.backpressure.enable_backpressure_control {
            return;
        }
        match self.monitor.sample(self.probe.pressure()) {
            PressureTransition::Engaged(pressure) => {
                tracing::warn!(
                    "Memory pressure {:.1}% above {:.1}%, pausing dispatch",
                    pressure * 100.0,
                    self.config.backpressure.memory_threshold * 100.0
                );
                self.metrics.add_backpressure_event();
                self.events.emit(PipelineEvent::BackpressureDetected {
                    pressure,
                    threshold: self.config.backpressure.memory_threshold,
                });
                self.events.emit(PipelineEvent::Paused {
                    reason: PauseReason::Backpressure,
                });
                self.refresh_pause_state();
            }
            PressureTransition::Released(pressure) => {
                tracing::info!(
                    "Memory pressure down to {:.1}%, resuming dispatch",
                    pressure * 100.0
                );
                self.events.emit(PipelineEvent::Resumed {
                    reason: PauseReason::Backpressure,
                });
                self.refresh_pause_state();
            }
            PressureTransition::Steady => {}
        }
    }

    fn can_start_new_work(&self, in_flight: usize) -> Result<bool> {
        if self.cancel.is_cancelled()
            || self.user_paused
            || self.monitor.is_engaged()
            || self.queue.is_empty()
        {
            return Ok(false);
        }
        let live = self.pool.live_workers();
        if live == 0 {
            return Err(Error::WorkerPool(
                "every worker context was lost".to_string(),
            ));
        }
        Ok(in_flight < self.config.processing.concurrent_chunks.min(live))
    }

    fn dispatch(&mut self, in_flight: &mut InFlight<E::Output>) -> Result<()> {
        while self.can_start_new_work(in_flight.len())? {
            let can_wait = !in_flight.is_empty() || self.queue.pending_retries() > 0;
            let consolidator = &self.consolidator;
            let Some(mut chunk) =
                self.resolver
                    .next_processable(&mut self.queue, |id| consolidator.succeeded(id), can_wait)
            else {
                break;
            };

            let ticket = self.pool.submit(&chunk)?;
            chunk.state = ChunkState::Running;
            self.state.record_started();
            self.metrics.add_chunk_started();
            tracing::debug!(
                "Dispatching {} (offset {}, {} bytes, attempt {})",
                chunk.id(),
                chunk.offset(),
                chunk.size(),
                chunk.retry_count() + 1
            );
            self.events.emit(PipelineEvent::ChunkStarted {
                chunk_id: chunk.id(),
                index: chunk.index(),
                offset: chunk.offset(),
                size: chunk.size(),
                attempt: chunk.retry_count() + 1,
            });

            let dispatched_at = Instant::now();
            in_flight.push(
                async move {
                    let outcome = ticket.await;
                    chunk.last_attempt_time = dispatched_at.elapsed();
                    (chunk, outcome)
                }
                .boxed(),
            );
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Option<Command>) {
        match command {
            Some(Command::Pause) if !self.user_paused => {
                self.user_paused = true;
                tracing::info!("Processing paused");
                self.events.emit(PipelineEvent::Paused {
                    reason: PauseReason::User,
                });
                self.refresh_pause_state();
            }
            Some(Command::Resume) if self.user_paused => {
                self.user_paused = false;
                tracing::info!("Processing resumed");
                self.events.emit(PipelineEvent::Resumed {
                    reason: PauseReason::User,
                });
                self.refresh_pause_state();
            }
            Some(_) => {}
            None => self.commands_open = false,
        }
    }

    fn handle_outcome(&mut self, chunk: Chunk, outcome: Result<WorkerOutput<E::Output>>) {
        match outcome {
            Ok(output) => self.on_success(chunk, output),
            Err(Error::Cancelled) if self.cancel.is_cancelled() => {}
            Err(e) => self.on_failure(chunk, e),
        }
    }

    fn on_success(&mut self, mut chunk: Chunk, output: WorkerOutput<E::Output>) {
        chunk.state = ChunkState::Completed;
        let elapsed = output.elapsed;
        let worker_id = output.worker_id;

        self.state.record_success(chunk.size());
        self.metrics.add_chunk_completed(chunk.size() as u64);
        self.events.emit(PipelineEvent::ChunkCompleted {
            chunk_id: chunk.id(),
            index: chunk.index(),
            processing_time: elapsed,
            worker_id,
        });

        if self.config.chunking.enable_adaptive_chunking {
            let previous = self.sizer.current();
            if let Some(current) = self.sizer.observe(elapsed) {
                self.state.current_chunk_size = current;
                self.metrics.add_adaptive_adjustment();
                self.aggregator.record_chunk_size(current);
                self.events
                    .emit(PipelineEvent::ChunkSizeAdjusted { previous, current });
            }
        }

        self.consolidator.record_success(&chunk, output);
        self.publish();
    }

    fn on_failure(&mut self, mut chunk: Chunk, error: Error) {
        let message = error.to_string();
        chunk.attempt_errors.push(message.clone());
        chunk.retry_count += 1;

        let retryable = match &error {
            Error::Extract { source, .. } => source.is_retryable(),
            _ => true,
        };
        let retry_attempts = self.config.retry.retry_attempts;

        if retryable && chunk.retry_count <= retry_attempts {
            let delay = self.config.retry.delay_for(chunk.retry_count);
            tracing::warn!(
                "{} attempt {}/{} failed: {}, retrying in {:?}",
                chunk.id(),
                chunk.retry_count,
                retry_attempts + 1,
                message,
                delay
            );
            self.state.record_retry();
            self.metrics.add_retry();
            self.events.emit(PipelineEvent::ChunkRetry {
                chunk_id: chunk.id(),
                retry_count: chunk.retry_count,
                delay,
                error: message,
            });
            self.queue.schedule_retry(chunk, Instant::now() + delay);
        } else {
            tracing::error!(
                "{} failed after {} attempts: {}",
                chunk.id(),
                chunk.retry_count,
                message
            );
            chunk.state = ChunkState::Failed;
            self.state.record_failure();
            self.metrics.add_chunk_failed();
            self.events.emit(PipelineEvent::ChunkFailed {
                chunk_id: chunk.id(),
                attempts: chunk.retry_count,
                error: message,
            });
            self.consolidator.record_failure(&chunk);
        }
        self.publish();
    }

    fn tick(&mut self) {
        self.state.update_rates(self.started_at.elapsed());
        self.aggregator.record_sample(&self.state);
        let snapshot = self.snapshot();
        if self.config.metrics.log_progress {
            MetricsReporter::log_progress(&self.state, &snapshot);
        }
        self.events.emit(PipelineEvent::Progress(self.state.clone()));
        self.state_tx.send_replace(self.state.clone());
        self.metrics_tx.send_replace(snapshot);
    }

    fn refresh_pause_state(&mut self) {
        self.state.is_paused = self.user_paused || self.monitor.is_engaged();
        self.state.status = if self.state.is_paused {
            RunStatus::Paused
        } else {
            RunStatus::Running
        };
        self.publish();
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.aggregator.snapshot(&self.metrics, self.state.throughput)
    }

    fn publish(&mut self) {
        self.state.update_rates(self.started_at.elapsed());
        self.state_tx.send_replace(self.state.clone());
        self.metrics_tx.send_replace(self.snapshot());
    }

    async fn finish(mut self) -> PipelineReport<E::Output> {
        self.pool.shutdown().await;

        let elapsed = self.started_at.elapsed();
        self.state.update_rates(elapsed);
        self.aggregator.record_sample(&self.state);
        self.state.chunks_in_progress = 0;
        self.state.is_paused = false;
        self.state.is_complete = true;
        self.state.status = RunStatus::Completed;

        let snapshot = self.snapshot();
        self.state_tx.send_replace(self.state.clone());
        self.metrics_tx.send_replace(snapshot.clone());

        let success = self.state.chunks_failed == 0;
        tracing::info!(
            "Processed {} chunks ({} failed) in {:.2}s",
            self.state.chunks_processed,
            self.state.chunks_failed,
            elapsed.as_secs_f64()
        );
        self.events.emit(PipelineEvent::Progress(self.state.clone()));
        self.events.emit(PipelineEvent::Completed {
            success,
            successful_chunks: self.state.chunks_processed,
            failed_chunks: self.state.chunks_failed,
        });

        if let Some(ref path) = self.config.metrics.output_path {
            if let Err(e) = snapshot.save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }

        let recommended = self.sizer.current();
        self.consolidator
            .finish(self.state, snapshot, elapsed, recommended)
    }

    async fn abort(&mut self, error: &Error) {
        self.pool.shutdown().await;
        self.queue.clear();
        self.consolidator.discard();

        self.state.chunks_in_progress = 0;
        self.state.is_paused = false;
        self.state.is_complete = false;
        self.state.status = if error.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        self.publish();

        if error.is_cancelled() {
            tracing::info!(
                "Processing cancelled after {} of {} chunks",
                self.state.chunks_processed,
                self.state.chunks_total
            );
            self.events.emit(PipelineEvent::Cancelled);
        } else {
            tracing::error!("Processing aborted: {}", error);
        }
    }
}
