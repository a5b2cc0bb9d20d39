//! Control surface for a running pipeline.

use super::metrics::MetricsSnapshot;
use super::state::ProcessingState;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Requests handled by the coordinating loop between dispatch rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Pause,
    Resume,
}

/// Cloneable handle to pause, resume, cancel and observe a run.
///
/// Obtained from `StreamingPipeline::handle` before the run starts; it stays
/// valid (and inert) after the run ends.
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    state: watch::Receiver<ProcessingState>,
    metrics: watch::Receiver<MetricsSnapshot>,
    live_workers: Arc<AtomicUsize>,
}

impl PipelineHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        cancel: CancellationToken,
        state: watch::Receiver<ProcessingState>,
        metrics: watch::Receiver<MetricsSnapshot>,
        live_workers: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            commands,
            cancel,
            state,
            metrics,
            live_workers,
        }
    }

    /// Stop dispatching new chunks. In-flight chunks run to completion.
    ///
    /// Returns false if the run has already finished.
    pub fn pause(&self) -> bool {
        self.commands.send(Command::Pause).is_ok()
    }

    /// Allow dispatch again, unless backpressure still holds it.
    pub fn resume(&self) -> bool {
        self.commands.send(Command::Resume).is_ok()
    }

    /// Abort the run. Queued work is discarded and `run` returns
    /// `Error::Cancelled`.
    ///
    /// No chunk starts after this call. `run` returns once extractor calls
    /// already running have finished, or once `chunk_timeout_ms` has passed
    /// when a chunk timeout is configured.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Latest published processing state.
    pub fn current_state(&self) -> ProcessingState {
        self.state.borrow().clone()
    }

    /// Latest published metrics snapshot.
    pub fn current_metrics(&self) -> MetricsSnapshot {
        self.metrics.borrow().clone()
    }

    /// Worker contexts currently alive.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Wait until the published state satisfies `predicate`.
    ///
    /// Returns the matching state, or `None` once the run is gone and no
    /// further states will be published.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Option<ProcessingState>
    where
        F: FnMut(&ProcessingState) -> bool,
    {
        let mut state = self.state.clone();
        let matched = state.wait_for(|s| predicate(s)).await.ok().map(|s| s.clone());
        matched
    }
}
