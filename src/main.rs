//! Chunkflow CLI
//!
//! Process large files in memory-bounded chunks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chunkflow::extractors::{ByteCounter, ChecksumExtractor, LineCounter};
use chunkflow::pipeline::MetricsReporter;
use chunkflow::{build_runtime, ChunkExtractor, Config, PipelineEvent, StreamingPipeline};

#[derive(Parser)]
#[command(name = "chunkflow")]
#[command(about = "Process large files as memory-bounded chunks", long_about = None)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the number of concurrent chunks
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a file
    Run {
        /// Input file
        #[arg(short, long)]
        input: PathBuf,

        /// What to extract from each chunk
        #[arg(short, long, value_enum, default_value_t = ExtractorKind::Lines)]
        extractor: ExtractorKind,

        /// Write the consolidated result as JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the chunk plan for a file without processing it
    Plan {
        /// Input file
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExtractorKind {
    /// Byte, newline and invalid UTF-8 byte counts
    Lines,
    /// BLAKE3 digest per chunk
    Checksum,
    /// Total byte count
    Bytes,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            extractor,
            output,
        } => {
            let config = load_config(cli.config.as_deref(), cli.concurrency)?;
            run_command(config, input, extractor, output)?;
        }

        Commands::Plan { input } => {
            let config = load_config(cli.config.as_deref(), cli.concurrency)?;
            plan_command(config, input)?;
        }

        Commands::Validate => {
            let path = cli
                .config
                .context("validate needs --config <path>")?;
            validate_command(&path)?;
        }

        Commands::GenerateConfig { output } => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>, concurrency: Option<usize>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Apply overrides
    if let Some(c) = concurrency {
        config.processing.concurrent_chunks = c;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(
    config: Config,
    input: PathBuf,
    extractor: ExtractorKind,
    output: Option<PathBuf>,
) -> Result<()> {
    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async {
        match extractor {
            ExtractorKind::Lines => process(config, LineCounter, &input, output.as_deref()).await,
            ExtractorKind::Checksum => {
                process(config, ChecksumExtractor, &input, output.as_deref()).await
            }
            ExtractorKind::Bytes => process(config, ByteCounter, &input, output.as_deref()).await,
        }
    })
}

async fn process<E>(config: Config, extractor: E, input: &Path, output: Option<&Path>) -> Result<()>
where
    E: ChunkExtractor + Clone + Sync,
    E::Output: Serialize,
{
    let mut pipeline = StreamingPipeline::with_extractor(config, extractor);
    let mut events = pipeline.subscribe();

    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                PipelineEvent::ChunkFailed {
                    chunk_id, error, ..
                } => tracing::debug!("{}: {} ({})", event.name(), chunk_id, error),
                PipelineEvent::ChunkSizeAdjusted { previous, current } => {
                    tracing::debug!("{}: {} -> {}", event.name(), previous, current)
                }
                _ => tracing::trace!("{}", event.name()),
            }
        }
    });

    let report = pipeline
        .run_file(input)
        .await
        .with_context(|| format!("processing {}", input.display()))?;
    let _ = logger.await;

    MetricsReporter::print_summary(&report.state, &report.metrics);
    for error in &report.errors {
        tracing::error!("{}", error);
    }

    let json = serde_json::to_string_pretty(&report.data)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)?;
            println!("Result written to: {}", path.display());
        }
        None => println!("{}", json),
    }

    if !report.success {
        anyhow::bail!(
            "{} of {} chunks failed",
            report.processing_info.failed_chunks,
            report.processing_info.total_chunks
        );
    }
    Ok(())
}

fn plan_command(config: Config, input: PathBuf) -> Result<()> {
    let total_size = std::fs::metadata(&input)
        .with_context(|| format!("reading metadata of {}", input.display()))?
        .len();
    let pipeline = StreamingPipeline::with_extractor(config, ByteCounter);
    let summary = pipeline.plan(total_size);
    let config = pipeline.config();

    println!("\n=== Chunk Plan ===");
    println!("Input: {}", input.display());
    println!("{}", summary);
    println!(
        "Concurrency: {} chunks in flight",
        config.processing.concurrent_chunks
    );
    println!(
        "Peak chunk memory: {:.2} MB",
        (summary.chunk_size * config.processing.concurrent_chunks) as f64 / (1024.0 * 1024.0)
    );
    println!(
        "Adaptive sizing: {}",
        if config.chunking.enable_adaptive_chunking {
            format!(
                "on ({} - {} bytes, target {}ms)",
                config.chunking.min_chunk_size,
                config.chunking.max_chunk_size,
                config.chunking.target_chunk_time_ms
            )
        } else {
            "off".to_string()
        }
    );
    println!("==================\n");
    Ok(())
}

fn validate_command(path: &Path) -> Result<()> {
    let config = Config::from_file(path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Chunkflow Configuration

# === CHUNKING: How the input is cut ===
chunking:
  # Size used when no memory estimate is available (bytes)
  chunk_size: 10485760

  # Bounds for computed and adaptive chunk sizes (bytes)
  min_chunk_size: 1048576
  max_chunk_size: 52428800

  # Steer future chunk sizes towards target_chunk_time_ms
  enable_adaptive_chunking: true
  target_chunk_time_ms: 2000

  # Cut chunks on demand so adaptive sizing shapes the current run
  incremental: false

  # Chunk dependencies: none | chain | anchor | explicit
  dependencies:
    kind: none
  # dependencies:
  #   kind: anchor
  #   every: 10

  # best_effort dispatches the queue head when nothing is ready;
  # strict waits for in-flight work first
  dependency_policy: best_effort

# === PROCESSING: Concurrency and workers ===
processing:
  # Coordinator poll interval while chunks wait for a free slot
  idle_poll_ms: 10

  # Chunks processed at once (defaults to the number of CPUs)
  # concurrent_chunks: 8

  # Per-chunk deadline; a timed-out worker context is replaced
  # chunk_timeout_ms: 30000

  # Tokio worker threads (null = num CPUs)
  # worker_threads: 8

# === RETRY: Failed chunk handling ===
retry:
  # Retries after the first attempt
  retry_attempts: 3
  # Backoff grows linearly: retry_delay_ms * retry count
  retry_delay_ms: 1000

# === BACKPRESSURE: Memory-based flow control ===
backpressure:
  enable_backpressure_control: true
  # Pause dispatch above this memory pressure
  memory_threshold: 0.8
  # Resume below memory_threshold * resume_ratio
  resume_ratio: 0.8
  poll_interval_ms: 100
  # Measure pressure against this budget instead of total memory
  # memory_limit_bytes: 8589934592

# === METRICS ===
metrics:
  progress_interval_ms: 1000
  history_limit: 100
  log_progress: true
  # output_path: "metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
