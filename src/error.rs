//! Error types for the chunk pipeline.

use thiserror::Error;

use crate::pipeline::ChunkId;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors.
///
/// Only [`Error::Initialization`], [`Error::WorkerPool`] and [`Error::Cancelled`]
/// ever abort a run. The chunk-level variants are recorded against the chunk
/// that produced them and surface in the final report.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run could not start (unreadable input, worker contexts unavailable)
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// The run was cancelled before consolidation
    #[error("Processing cancelled")]
    Cancelled,

    /// A worker context died while holding a chunk
    #[error("Worker {worker_id} crashed while processing {chunk_id}: {message}")]
    WorkerCrashed {
        worker_id: usize,
        chunk_id: ChunkId,
        message: String,
    },

    /// A chunk exceeded the per-chunk processing timeout
    #[error("{chunk_id} timed out after {timeout_ms}ms")]
    ChunkTimeout { chunk_id: ChunkId, timeout_ms: u64 },

    /// The extractor rejected a chunk
    #[error("Extraction failed for {chunk_id}: {source}")]
    Extract {
        chunk_id: ChunkId,
        #[source]
        source: ExtractError,
    },

    /// Invalid dependency declaration
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// The worker pool can no longer make progress
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an initialization error
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    /// Create a dependency error
    pub fn dependency(message: impl Into<String>) -> Self {
        Self::Dependency(message.into())
    }

    /// Whether this error terminates the whole run rather than a single chunk.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Initialization(_) | Self::WorkerPool(_) | Self::Cancelled | Self::Config(_)
        )
    }

    /// Whether this error is the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Error returned by a chunk extractor.
///
/// Extractors are external collaborators, so the error only carries a message
/// and a retryability hint. Non-retryable errors skip the remaining retry budget.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExtractError {
    message: String,
    retryable: bool,
}

impl ExtractError {
    /// A transient failure, retried up to the configured budget.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}
