//! Per-run processing state.

use serde::Serialize;
use std::time::Duration;

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Preparing,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

/// Snapshot of a run's progress.
///
/// Written only by the coordinating loop; readers receive copies.
/// `chunks_processed + chunks_in_progress + chunks_failed <= chunks_total`
/// holds at every publication, and `processed_size` never decreases.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingState {
    pub total_size: u64,
    pub processed_size: u64,
    pub chunks_total: usize,
    pub chunks_processed: usize,
    pub chunks_in_progress: usize,
    pub chunks_failed: usize,
    pub current_chunk_size: usize,
    /// Bytes per second
    pub throughput: f64,
    /// Failed chunks over total chunks
    pub error_rate: f64,
    #[serde(with = "optional_millis")]
    pub estimated_time_remaining: Option<Duration>,
    #[serde(with = "millis")]
    pub elapsed: Duration,
    pub is_complete: bool,
    pub is_paused: bool,
    pub status: RunStatus,
}

impl ProcessingState {
    pub fn new(total_size: u64, current_chunk_size: usize) -> Self {
        Self {
            total_size,
            processed_size: 0,
            chunks_total: 0,
            chunks_processed: 0,
            chunks_in_progress: 0,
            chunks_failed: 0,
            current_chunk_size,
            throughput: 0.0,
            error_rate: 0.0,
            estimated_time_remaining: None,
            elapsed: Duration::ZERO,
            is_complete: false,
            is_paused: false,
            status: RunStatus::Preparing,
        }
    }

    /// Fraction of input bytes processed, in percent.
    pub fn progress_percent(&self) -> f64 {
        if self.total_size == 0 {
            return if self.is_complete { 100.0 } else { 0.0 };
        }
        self.processed_size as f64 / self.total_size as f64 * 100.0
    }

    pub(crate) fn record_started(&mut self) {
        self.chunks_in_progress += 1;
    }

    pub(crate) fn record_success(&mut self, size: usize) {
        self.chunks_in_progress = self.chunks_in_progress.saturating_sub(1);
        self.chunks_processed += 1;
        self.processed_size = (self.processed_size + size as u64).min(self.total_size);
        self.refresh_error_rate();
    }

    /// A failed attempt that will be retried: the chunk is pending again.
    pub(crate) fn record_retry(&mut self) {
        self.chunks_in_progress = self.chunks_in_progress.saturating_sub(1);
    }

    pub(crate) fn record_failure(&mut self) {
        self.chunks_in_progress = self.chunks_in_progress.saturating_sub(1);
        self.chunks_failed += 1;
        self.refresh_error_rate();
    }

    /// Recompute throughput and ETA for the given elapsed time.
    pub(crate) fn update_rates(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.throughput = if elapsed_ms > 0.0 {
            self.processed_size as f64 / elapsed_ms * 1000.0
        } else {
            0.0
        };
        let remaining = self.total_size - self.processed_size;
        self.estimated_time_remaining = if remaining == 0 {
            Some(Duration::ZERO)
        } else if self.throughput > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / self.throughput))
        } else {
            None
        };
        self.refresh_error_rate();
    }

    fn refresh_error_rate(&mut self) {
        self.error_rate = if self.chunks_total > 0 {
            self.chunks_failed as f64 / self.chunks_total as f64
        } else {
            0.0
        };
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

mod optional_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}
