//! Configuration for the chunk pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the chunk pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chunk planning configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Worker and scheduling configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Retry configuration for failed chunks
    #[serde(default)]
    pub retry: RetryConfig,

    /// Memory backpressure configuration
    #[serde(default)]
    pub backpressure: BackpressureConfig,

    /// Progress and metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Chunk planning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Preferred chunk size in bytes, used before planning and when no
    /// memory estimate is available
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Smallest chunk the planner or the adaptive controller may produce
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    /// Largest chunk the planner or the adaptive controller may produce
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    /// Resize future chunks from observed processing time
    #[serde(default = "default_true")]
    pub enable_adaptive_chunking: bool,

    /// Cut chunks lazily so adaptive sizing affects the current run
    #[serde(default)]
    pub incremental: bool,

    /// Target processing time per chunk for the adaptive controller
    #[serde(default = "default_target_chunk_time_ms")]
    pub target_chunk_time_ms: u64,

    /// Dependency rule applied when chunks are created
    #[serde(default)]
    pub dependencies: DependencyRule,

    /// How the scheduler treats chunks whose dependencies are unresolved
    #[serde(default)]
    pub dependency_policy: DependencyPolicy,
}

/// Dependency rule assigned at chunk creation.
///
/// Every rule only points at lower chunk indices, so the resulting graph is
/// always acyclic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DependencyRule {
    /// Chunks are independent
    #[default]
    None,
    /// Each chunk depends on its predecessor
    Chain,
    /// Every `every`-th chunk depends on chunk 0
    Anchor { every: usize },
    /// Explicit per-index dependency lists
    Explicit { edges: BTreeMap<usize, Vec<usize>> },
}

/// Fallback behaviour when no queued chunk has its dependencies resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Dispatch the head of the queue anyway
    #[default]
    BestEffort,
    /// Wait for in-flight work; fall back to the head only when nothing can
    /// resolve the wait
    Strict,
}

/// Worker and scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of chunks processed concurrently (one worker context each)
    #[serde(default = "default_concurrent_chunks")]
    pub concurrent_chunks: usize,

    /// Optional hard limit on a single chunk attempt. A timed-out attempt is
    /// a retryable failure and its worker context is replaced.
    #[serde(default)]
    pub chunk_timeout_ms: Option<u64>,

    /// Poll interval while nothing can be dispatched
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Number of Tokio worker threads (CLI only)
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

/// Retry configuration for failed chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay; attempt `n` waits `retry_delay_ms * n`
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Memory backpressure configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Pause dispatch when memory pressure rises above the threshold
    #[serde(default = "default_true")]
    pub enable_backpressure_control: bool,

    /// Memory pressure ratio (0-1) above which dispatch pauses. Also scales
    /// the memory budget used by the planner.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,

    /// Dispatch resumes once pressure drops below `resume_ratio * memory_threshold`
    #[serde(default = "default_resume_ratio")]
    pub resume_ratio: f64,

    /// Poll interval while paused for memory relief
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Memory limit for the pressure ratio. Defaults to total system memory.
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
}

/// Progress and metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Progress tick interval
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Rolling history length for throughput and chunk-size samples
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Log a progress line on every tick
    #[serde(default = "default_true")]
    pub log_progress: bool,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub output_path: Option<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            enable_adaptive_chunking: true,
            incremental: false,
            target_chunk_time_ms: default_target_chunk_time_ms(),
            dependencies: DependencyRule::None,
            dependency_policy: DependencyPolicy::BestEffort,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrent_chunks: default_concurrent_chunks(),
            chunk_timeout_ms: None,
            idle_poll_ms: default_idle_poll_ms(),
            worker_threads: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enable_backpressure_control: true,
            memory_threshold: default_memory_threshold(),
            resume_ratio: default_resume_ratio(),
            poll_interval_ms: default_poll_interval_ms(),
            memory_limit_bytes: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            history_limit: default_history_limit(),
            log_progress: true,
            output_path: None,
        }
    }
}

impl RetryConfig {
    /// Backoff before the given retry (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(retry_count as u64))
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let c = &self.chunking;
        if c.min_chunk_size == 0 {
            anyhow::bail!("min_chunk_size must be > 0");
        }
        if c.min_chunk_size > c.max_chunk_size {
            anyhow::bail!(
                "min_chunk_size ({}) must not exceed max_chunk_size ({})",
                c.min_chunk_size,
                c.max_chunk_size
            );
        }
        if c.chunk_size == 0 {
            anyhow::bail!("chunk_size must be > 0");
        }
        if c.target_chunk_time_ms == 0 {
            anyhow::bail!("target_chunk_time_ms must be > 0");
        }
        if let DependencyRule::Anchor { every } = c.dependencies {
            if every == 0 {
                anyhow::bail!("anchor dependency interval must be > 0");
            }
        }
        if let DependencyRule::Explicit { edges } = &c.dependencies {
            for (index, deps) in edges {
                if let Some(bad) = deps.iter().find(|d| **d >= *index) {
                    anyhow::bail!(
                        "chunk {} may only depend on lower indices (found {})",
                        index,
                        bad
                    );
                }
            }
        }
        if self.processing.concurrent_chunks == 0 {
            anyhow::bail!("concurrent_chunks must be > 0");
        }
        if self.processing.chunk_timeout_ms == Some(0) {
            anyhow::bail!("chunk_timeout_ms must be > 0 when set");
        }
        let b = &self.backpressure;
        if !(b.memory_threshold > 0.0 && b.memory_threshold <= 1.0) {
            anyhow::bail!("memory_threshold must be in (0, 1], got {}", b.memory_threshold);
        }
        if !(b.resume_ratio > 0.0 && b.resume_ratio <= 1.0) {
            anyhow::bail!("resume_ratio must be in (0, 1], got {}", b.resume_ratio);
        }
        if b.memory_limit_bytes == Some(0) {
            anyhow::bail!("memory_limit_bytes must be > 0 when set");
        }
        if self.metrics.history_limit == 0 {
            anyhow::bail!("history_limit must be > 0");
        }
        if self.metrics.progress_interval_ms == 0 {
            anyhow::bail!("progress_interval_ms must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
const MB: usize = 1024 * 1024;
fn default_chunk_size() -> usize { 10 * MB }
fn default_min_chunk_size() -> usize { MB }
fn default_max_chunk_size() -> usize { 50 * MB }
fn default_target_chunk_time_ms() -> u64 { 2000 }
fn default_concurrent_chunks() -> usize { num_cpus::get().max(1) }
fn default_idle_poll_ms() -> u64 { 10 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 1000 }
fn default_memory_threshold() -> f64 { 0.8 }
fn default_resume_ratio() -> f64 { 0.8 }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_progress_interval_ms() -> u64 { 1000 }
fn default_history_limit() -> usize { 100 }
fn default_true() -> bool { true }
