//! Fixed-size pool of worker contexts running the extractor.
//!
//! ```text
//!                  ┌──────────┐
//!   submit() ────▶ │ job queue│ ──▶ worker 0 ──▶ spawn_blocking(extract)
//!                  │ (MPMC)   │ ──▶ worker 1 ──▶ spawn_blocking(extract)
//!                  └──────────┘ ──▶ ...
//!                                       │
//!   Ticket  ◀──────── oneshot reply ────┘
//! ```
//!
//! Each worker owns one extractor instance and handles one chunk at a time.
//! The extractor is moved onto the blocking pool for the call and handed back
//! afterwards. A panic or a timeout loses the instance: the worker builds a
//! fresh one from the factory (a new generation) before taking more work. If
//! the factory fails the worker retires and the pool shrinks. When the last
//! worker retires the job queue closes and further submissions fail.
//!
//! Every extractor call runs under a [`TaskTracker`], so [`WorkerPool::shutdown`]
//! can wait until no call is left on the blocking pool.

use super::chunk::{Chunk, ChunkId, ChunkMetadata};
use super::metrics::Metrics;
use crate::error::{Error, Result};
use crate::extract::{ChunkExtractor, ExtractorFactory};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker contexts
    pub size: usize,
    /// Per-chunk deadline; `None` waits indefinitely
    pub chunk_timeout: Option<Duration>,
}

/// A successful extractor call.
#[derive(Debug)]
pub struct WorkerOutput<T> {
    pub output: T,
    pub worker_id: usize,
    /// Wall time spent in the extractor
    pub elapsed: Duration,
}

/// Notice that a worker context was recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReplacement {
    pub worker_id: usize,
    pub generation: u64,
}

struct Job<T> {
    chunk_id: ChunkId,
    payload: Bytes,
    metadata: ChunkMetadata,
    reply: oneshot::Sender<Result<WorkerOutput<T>>>,
}

/// Pending result of a submitted chunk.
///
/// Resolves to [`Error::Cancelled`] if the pool shuts down before the chunk
/// is processed.
pub struct Ticket<T> {
    rx: oneshot::Receiver<Result<WorkerOutput<T>>>,
}

impl<T> Future for Ticket<T> {
    type Output = Result<WorkerOutput<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(Error::Cancelled)))
    }
}

/// Decrements the live worker count once, when the worker retires or its
/// task ends, whichever comes first.
struct LiveGuard(Option<Arc<AtomicUsize>>);

impl LiveGuard {
    /// Leave the live set now. Returns the number of workers still live.
    fn release(&mut self) -> usize {
        match self.0.take() {
            Some(live) => live.fetch_sub(1, Ordering::SeqCst) - 1,
            None => 0,
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Worker pool.
pub struct WorkerPool<E: ChunkExtractor> {
    jobs_tx: async_channel::Sender<Job<E::Output>>,
    jobs_rx: async_channel::Receiver<Job<E::Output>>,
    handles: Vec<JoinHandle<()>>,
    calls: TaskTracker,
    live: Arc<AtomicUsize>,
    chunk_timeout: Option<Duration>,
}

impl<E: ChunkExtractor> WorkerPool<E> {
    /// Build every worker context and start the worker tasks.
    ///
    /// Fails with [`Error::Initialization`] if any context cannot be built.
    /// `live` is reset to the pool size and tracks running workers from here on.
    pub fn start(
        config: WorkerPoolConfig,
        factory: ExtractorFactory<E>,
        metrics: Arc<Metrics>,
        live: Arc<AtomicUsize>,
        replacements: mpsc::UnboundedSender<WorkerReplacement>,
    ) -> Result<Self> {
        let size = config.size.max(1);
        let mut extractors = Vec::with_capacity(size);
        for worker_id in 0..size {
            let extractor = factory().map_err(|e| {
                Error::initialization(format!("worker {} context: {}", worker_id, e))
            })?;
            extractors.push(extractor);
        }

        let (jobs_tx, jobs_rx) = async_channel::unbounded::<Job<E::Output>>();
        let calls = TaskTracker::new();
        live.store(size, Ordering::SeqCst);

        let handles = extractors
            .into_iter()
            .enumerate()
            .map(|(worker_id, extractor)| {
                let worker = Worker {
                    id: worker_id,
                    generation: 0,
                    extractor: Some(extractor),
                    factory: factory.clone(),
                    metrics: metrics.clone(),
                    calls: calls.clone(),
                    live: LiveGuard(Some(live.clone())),
                    replacements: replacements.clone(),
                    chunk_timeout: config.chunk_timeout,
                };
                tokio::spawn(worker.run(jobs_rx.clone()))
            })
            .collect();

        tracing::debug!("Started {} worker contexts", size);

        Ok(Self {
            jobs_tx,
            jobs_rx,
            handles,
            calls,
            live,
            chunk_timeout: config.chunk_timeout,
        })
    }

    /// Queue a chunk for the next idle worker.
    ///
    /// Fails with [`Error::WorkerPool`] once the pool is shut down or every
    /// worker has retired.
    pub fn submit(&self, chunk: &Chunk) -> Result<Ticket<E::Output>> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            chunk_id: chunk.id(),
            payload: chunk.payload().clone(),
            metadata: chunk.metadata(),
            reply,
        };
        self.jobs_tx
            .try_send(job)
            .map_err(|_| Error::WorkerPool("job queue closed".to_string()))?;
        Ok(Ticket { rx })
    }

    /// Workers still able to take work.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Extractor calls currently running on the blocking pool, including
    /// calls abandoned after a timeout.
    pub fn running_calls(&self) -> usize {
        self.calls.len()
    }

    /// Stop all workers and fail every queued job with [`Error::Cancelled`].
    ///
    /// Waits for extractor calls already running on the blocking pool to
    /// return. With a chunk timeout configured the wait is bounded by it, and
    /// calls still running after that are left to finish on their own.
    pub async fn shutdown(&mut self) {
        self.jobs_tx.close();
        while let Ok(job) = self.jobs_rx.try_recv() {
            drop(job);
        }

        self.calls.close();
        match self.chunk_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, self.calls.wait()).await.is_err() {
                    tracing::warn!(
                        "{} extractor calls still running after shutdown",
                        self.calls.len()
                    );
                }
            }
            None => self.calls.wait().await,
        }

        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::debug!("Worker pool shut down");
    }
}

impl<E: ChunkExtractor> Drop for WorkerPool<E> {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

struct Worker<E: ChunkExtractor> {
    id: usize,
    generation: u64,
    extractor: Option<E>,
    factory: ExtractorFactory<E>,
    metrics: Arc<Metrics>,
    calls: TaskTracker,
    live: LiveGuard,
    replacements: mpsc::UnboundedSender<WorkerReplacement>,
    chunk_timeout: Option<Duration>,
}

impl<E: ChunkExtractor> Worker<E> {
    async fn run(mut self, jobs: async_channel::Receiver<Job<E::Output>>) {
        while let Ok(job) = jobs.recv().await {
            let Some(extractor) = self.extractor.take() else {
                break;
            };

            let outcome = self.process(extractor, &job).await;

            // Replacement notice and live count must be visible before the reply
            let retire = self.extractor.is_none() && !self.replace();
            if retire && self.live.release() == 0 {
                // Last worker out: later submits fail, queued tickets resolve to Cancelled
                jobs.close();
                while let Ok(stranded) = jobs.try_recv() {
                    drop(stranded);
                }
            }
            let _ = job.reply.send(outcome);
            if retire {
                break;
            }
        }
        tracing::trace!("Worker {} exiting", self.id);
    }

    async fn process(
        &mut self,
        mut extractor: E,
        job: &Job<E::Output>,
    ) -> Result<WorkerOutput<E::Output>> {
        let payload = job.payload.clone();
        let metadata = job.metadata.clone();
        let offset = metadata.offset;
        let start = Instant::now();

        let call = self.calls.spawn_blocking(move || {
            let result = extractor.extract(&payload, offset, &metadata);
            (extractor, result)
        });

        let joined = match self.chunk_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(
                        "Worker {} timed out on {} after {:?}",
                        self.id,
                        job.chunk_id,
                        limit
                    );
                    self.metrics.add_chunk_timeout();
                    return Err(Error::ChunkTimeout {
                        chunk_id: job.chunk_id,
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => call.await,
        };

        let elapsed = start.elapsed();
        self.metrics.add_extract_time(elapsed);

        match joined {
            Ok((extractor, Ok(output))) => {
                self.extractor = Some(extractor);
                Ok(WorkerOutput {
                    output,
                    worker_id: self.id,
                    elapsed,
                })
            }
            Ok((extractor, Err(source))) => {
                self.extractor = Some(extractor);
                Err(Error::Extract {
                    chunk_id: job.chunk_id,
                    source,
                })
            }
            Err(e) => {
                tracing::warn!("Worker {} crashed on {}: {}", self.id, job.chunk_id, e);
                Err(Error::WorkerCrashed {
                    worker_id: self.id,
                    chunk_id: job.chunk_id,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Build a fresh extractor after the previous one was lost.
    fn replace(&mut self) -> bool {
        match (self.factory)() {
            Ok(extractor) => {
                self.extractor = Some(extractor);
                self.generation += 1;
                self.metrics.add_worker_replaced();
                tracing::info!(
                    "Worker {} context replaced (generation {})",
                    self.id,
                    self.generation
                );
                let _ = self.replacements.send(WorkerReplacement {
                    worker_id: self.id,
                    generation: self.generation,
                });
                true
            }
            Err(e) => {
                tracing::error!("Worker {} could not be replaced: {}", self.id, e);
                false
            }
        }
    }
}
