//! Throughput monitoring and metrics collection.

use super::state::ProcessingState;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters shared between the coordinator and the worker contexts.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Chunk attempts dispatched to workers
    pub chunks_started: AtomicU64,

    /// Chunks that completed successfully
    pub chunks_completed: AtomicU64,

    /// Chunks that failed permanently
    pub chunks_failed: AtomicU64,

    /// Retries scheduled
    pub retries: AtomicU64,

    /// Payload bytes of successfully processed chunks
    pub bytes_processed: AtomicU64,

    /// Worker contexts discarded and recreated
    pub workers_replaced: AtomicU64,

    /// Chunk attempts that hit the per-chunk timeout
    pub chunk_timeouts: AtomicU64,

    /// Times backpressure paused dispatch
    pub backpressure_events: AtomicU64,

    /// Adaptive chunk size changes applied
    pub adaptive_adjustments: AtomicU64,

    /// Time spent inside the extractor (microseconds, summed across workers)
    pub extract_us: AtomicU64,

    /// Start time
    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record a dispatched chunk attempt.
    pub fn add_chunk_started(&self) {
        self.chunks_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed chunk and its size.
    pub fn add_chunk_completed(&self, bytes: u64) {
        self.chunks_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a permanently failed chunk.
    pub fn add_chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a scheduled retry.
    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a replaced worker context.
    pub fn add_worker_replaced(&self) {
        self.workers_replaced.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a timed-out chunk attempt.
    pub fn add_chunk_timeout(&self) {
        self.chunk_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a backpressure pause.
    pub fn add_backpressure_event(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an applied chunk size adjustment.
    pub fn add_adaptive_adjustment(&self) {
        self.adaptive_adjustments.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in the extractor.
    pub fn add_extract_time(&self, duration: Duration) {
        self.extract_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get chunks per second.
    pub fn chunks_per_second(&self) -> f64 {
        let chunks = self.chunks_completed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            chunks as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// One progress-tick sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputSample {
    pub elapsed_ms: u64,
    /// Bytes per second
    pub throughput: f64,
    pub processed_size: u64,
}

/// Rolling histories owned by the coordinating loop.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    limit: usize,
    throughput_history: VecDeque<ThroughputSample>,
    chunk_size_history: VecDeque<usize>,
    peak_throughput: f64,
}

impl MetricsAggregator {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            throughput_history: VecDeque::new(),
            chunk_size_history: VecDeque::new(),
            peak_throughput: 0.0,
        }
    }

    /// Append a throughput sample from the current state, dropping the oldest
    /// beyond the window.
    pub fn record_sample(&mut self, state: &ProcessingState) -> ThroughputSample {
        let sample = ThroughputSample {
            elapsed_ms: state.elapsed.as_millis() as u64,
            throughput: state.throughput,
            processed_size: state.processed_size,
        };
        if sample.throughput > self.peak_throughput {
            self.peak_throughput = sample.throughput;
        }
        push_bounded(&mut self.throughput_history, sample, self.limit);
        sample
    }

    /// Append a chunk size to the size history.
    pub fn record_chunk_size(&mut self, size: usize) {
        push_bounded(&mut self.chunk_size_history, size, self.limit);
    }

    pub fn peak_throughput(&self) -> f64 {
        self.peak_throughput
    }

    pub fn throughput_history(&self) -> impl Iterator<Item = &ThroughputSample> {
        self.throughput_history.iter()
    }

    pub fn chunk_size_history(&self) -> impl Iterator<Item = &usize> {
        self.chunk_size_history.iter()
    }

    /// Combine the histories with the shared counters.
    pub fn snapshot(&self, metrics: &Metrics, throughput: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            throughput,
            peak_throughput: self.peak_throughput.max(throughput),
            chunks_started: metrics.chunks_started.load(Ordering::Relaxed),
            chunks_completed: metrics.chunks_completed.load(Ordering::Relaxed),
            chunks_failed: metrics.chunks_failed.load(Ordering::Relaxed),
            retries: metrics.retries.load(Ordering::Relaxed),
            bytes_processed: metrics.bytes_processed.load(Ordering::Relaxed),
            workers_replaced: metrics.workers_replaced.load(Ordering::Relaxed),
            chunk_timeouts: metrics.chunk_timeouts.load(Ordering::Relaxed),
            backpressure_events: metrics.backpressure_events.load(Ordering::Relaxed),
            adaptive_adjustments: metrics.adaptive_adjustments.load(Ordering::Relaxed),
            extract_secs: metrics.extract_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            elapsed: metrics.elapsed(),
            chunk_size_history: self.chunk_size_history.iter().copied().collect(),
            throughput_history: self.throughput_history.iter().copied().collect(),
        }
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T, limit: usize) {
    history.push_back(value);
    while history.len() > limit {
        history.pop_front();
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Bytes per second at the time of the snapshot
    pub throughput: f64,
    /// Highest sampled throughput (bytes per second)
    pub peak_throughput: f64,
    pub chunks_started: u64,
    pub chunks_completed: u64,
    pub chunks_failed: u64,
    pub retries: u64,
    pub bytes_processed: u64,
    pub workers_replaced: u64,
    pub chunk_timeouts: u64,
    pub backpressure_events: u64,
    pub adaptive_adjustments: u64,
    /// Total time spent in the extractor (seconds, summed across workers)
    pub extract_secs: f64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub chunk_size_history: Vec<usize>,
    pub throughput_history: Vec<ThroughputSample>,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} completed, {} failed | Data: {:.2} MB @ {:.2} MB/s (peak {:.2}) | \
             Retries: {} | Backpressure: {} | Adjustments: {} | Workers replaced: {} | Elapsed: {:.1}s",
            self.chunks_completed,
            self.chunks_failed,
            self.bytes_processed as f64 / (1024.0 * 1024.0),
            self.throughput / (1024.0 * 1024.0),
            self.peak_throughput / (1024.0 * 1024.0),
            self.retries,
            self.backpressure_events,
            self.adaptive_adjustments,
            self.workers_replaced,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Progress logging and end-of-run summaries.
pub struct MetricsReporter;

impl MetricsReporter {
    /// Log a progress line for a tick.
    pub fn log_progress(state: &ProcessingState, snapshot: &MetricsSnapshot) {
        tracing::info!("[{:.1}%] {}", state.progress_percent(), snapshot);
    }

    /// Print a final summary.
    pub fn print_summary(state: &ProcessingState, snapshot: &MetricsSnapshot) {
        println!("\n=== Pipeline Summary ===");
        println!("Status: {:?}", state.status);
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Chunks total: {}", state.chunks_total);
        println!("Chunks processed: {}", state.chunks_processed);
        println!("Chunks failed: {}", state.chunks_failed);
        println!(
            "Data processed: {:.2} MB of {:.2} MB",
            state.processed_size as f64 / (1024.0 * 1024.0),
            state.total_size as f64 / (1024.0 * 1024.0)
        );
        println!(
            "Throughput: {:.2} MB/s (peak {:.2} MB/s)",
            snapshot.throughput / (1024.0 * 1024.0),
            snapshot.peak_throughput / (1024.0 * 1024.0)
        );
        println!("Processing rate: {:.1} chunks/s", rate(snapshot));
        println!("Retries: {}", snapshot.retries);
        println!("Backpressure events: {}", snapshot.backpressure_events);
        println!("Adaptive adjustments: {}", snapshot.adaptive_adjustments);
        if snapshot.workers_replaced > 0 || snapshot.chunk_timeouts > 0 {
            println!("\n--- Worker Recovery ---");
            println!("Workers replaced: {}", snapshot.workers_replaced);
            println!("Chunk timeouts: {}", snapshot.chunk_timeouts);
        }
        if let Some(size) = snapshot.chunk_size_history.last() {
            println!("Final chunk size: {:.2} MB", *size as f64 / (1024.0 * 1024.0));
        }
        println!("========================\n");
    }
}

fn rate(snapshot: &MetricsSnapshot) -> f64 {
    let elapsed = snapshot.elapsed.as_secs_f64();
    if elapsed > 0.0 {
        snapshot.chunks_completed as f64 / elapsed
    } else {
        0.0
    }
}
