//! End-to-end runs of the coordinating loop with real worker contexts.

use crate::config::{Config, DependencyPolicy, DependencyRule};
use crate::error::{Error, ExtractError};
use crate::extract::from_fn;
use crate::extractors::ByteCounter;
use crate::pipeline::{ChunkMetadata, ManualMemoryProbe, PauseReason, PipelineEvent, RunStatus};
use crate::{PipelineHandle, StreamingPipeline};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;

fn test_config(chunk_size: usize, concurrency: usize) -> Config {
    let mut config = Config::default();
    config.chunking.chunk_size = chunk_size;
    config.chunking.min_chunk_size = 1;
    config.chunking.max_chunk_size = chunk_size * 64;
    config.chunking.enable_adaptive_chunking = false;
    config.processing.concurrent_chunks = concurrency;
    config.processing.idle_poll_ms = 2;
    config.retry.retry_delay_ms = 5;
    config.backpressure.memory_threshold = 0.7;
    config.backpressure.poll_interval_ms = 5;
    config.metrics.progress_interval_ms = 20;
    config.metrics.log_progress = false;
    config
}

/// Probe with low pressure and no memory estimate, so the configured chunk
/// size is used as-is.
fn calm_probe() -> Arc<ManualMemoryProbe> {
    Arc::new(ManualMemoryProbe::new(0.1, 0))
}

fn drain(rx: &mut mpsc::UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count(events: &[PipelineEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}

fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

#[tokio::test]
async fn test_ten_megabyte_input_in_one_megabyte_chunks() {
    const MB: usize = 1024 * 1024;
    let mut config = test_config(MB, 4);
    config.chunking.min_chunk_size = 1024;

    let mut pipeline =
        StreamingPipeline::with_extractor(config, ByteCounter).with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();
    assert_eq!(pipeline.plan(10_485_760).chunk_count, 10);

    let report = pipeline.run(vec![7u8; 10_485_760]).await.unwrap();

    assert!(report.success);
    assert_eq!(report.data, 10_485_760);
    assert_eq!(report.processing_info.total_chunks, 10);
    assert_eq!(report.processing_info.average_chunk_size, MB);
    let mut expected_offset = 0u64;
    for (i, chunk) in report.chunks.iter().enumerate() {
        assert_eq!(chunk.index, i);
        assert_eq!(chunk.offset, expected_offset);
        assert_eq!(chunk.size, MB);
        expected_offset += chunk.size as u64;
    }
    assert_eq!(expected_offset, 10_485_760);

    let events = drain(&mut events);
    assert!(matches!(
        events.first(),
        Some(PipelineEvent::Prepared {
            chunks_total: 10,
            chunk_size: MB,
            ..
        })
    ));
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::Completed {
            success: true,
            successful_chunks: 10,
            failed_chunks: 0
        })
    ));
}

#[tokio::test]
async fn test_chunk_fails_twice_then_succeeds() {
    let extractor = from_fn(|bytes: &[u8], _, meta: &ChunkMetadata| {
        if meta.index == 2 && meta.attempt <= 2 {
            return Err(ExtractError::new(format!("transient {}", meta.attempt)));
        }
        Ok(bytes.to_vec())
    });
    let mut pipeline = StreamingPipeline::with_extractor(test_config(4, 2), extractor)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();

    let report = pipeline.run(&b"aaaabbbbccccdddd"[..]).await.unwrap();

    assert!(report.success);
    assert!(report.errors.is_empty());
    assert_eq!(report.data, b"aaaabbbbccccdddd".to_vec());
    assert_eq!(report.chunks[2].attempts, 3);
    assert_eq!(report.chunks[0].attempts, 1);
    assert_eq!(report.metrics.retries, 2);

    let events = drain(&mut events);
    let retries: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::ChunkRetry {
                chunk_id,
                retry_count,
                delay,
                ..
            } => Some((chunk_id.get(), *retry_count, *delay)),
            _ => None,
        })
        .collect();
    // Linear backoff: retry_delay * retry_count
    assert_eq!(
        retries,
        vec![(2, 1, Duration::from_millis(5)), (2, 2, Duration::from_millis(10))]
    );
    assert_eq!(count(&events, "chunk-processing-failed"), 0);
}

#[tokio::test]
async fn test_chunk_fails_every_attempt() {
    let extractor = from_fn(|bytes: &[u8], _, meta: &ChunkMetadata| {
        if meta.index == 1 {
            return Err(ExtractError::new("corrupt record"));
        }
        Ok(bytes.to_vec())
    });
    let mut pipeline = StreamingPipeline::with_extractor(test_config(3, 2), extractor)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();

    let report = pipeline.run(&b"aaabbbccc"[..]).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("chunk-1 failed after 4 attempts"));
    assert_eq!(report.data, b"aaaccc".to_vec());
    assert_eq!(report.processing_info.failed_chunks, 1);
    assert_eq!(report.processing_info.successful_chunks, 2);
    assert_eq!(report.state.chunks_failed, 1);

    let events = drain(&mut events);
    let attempts_of_chunk_1 = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::ChunkStarted { index: 1, .. }))
        .count();
    assert_eq!(attempts_of_chunk_1, 4);
    assert_eq!(count(&events, "chunk-retry"), 3);
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::ChunkFailed { attempts: 4, .. })));
}

#[tokio::test]
async fn test_permanent_error_skips_retries() {
    let extractor = from_fn(|_: &[u8], _, meta: &ChunkMetadata| {
        if meta.index == 0 {
            sleep_ms(15);
            return Err(ExtractError::permanent("unsupported format"));
        }
        Ok(1u64)
    });
    let mut pipeline = StreamingPipeline::with_extractor(test_config(2, 1), extractor)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();

    let report = pipeline.run(&b"aabb"[..]).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.data, 1);
    assert_eq!(report.chunks[0].attempts, 1);
    assert!(report.chunks[0].processing_time_ms >= 15);
    assert_eq!(count(&drain(&mut events), "chunk-retry"), 0);
}

#[tokio::test]
async fn test_backpressure_gates_dispatch() {
    let probe = calm_probe();
    let extractor = {
        let probe = probe.clone();
        from_fn(move |bytes: &[u8], _, meta: &ChunkMetadata| {
            if meta.index == 2 && meta.attempt == 1 {
                probe.set_pressure(0.9);
            }
            sleep_ms(10);
            Ok(bytes.len())
        })
    };
    let mut pipeline = StreamingPipeline::with_extractor(test_config(1, 2), extractor)
        .with_memory_probe(probe.clone());
    let mut events = pipeline.subscribe();
    let handle = pipeline.handle();

    let run = tokio::spawn(pipeline.run(vec![0u8; 8]));

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let detected = matches!(event, PipelineEvent::BackpressureDetected { .. });
        seen.push(event);
        if detected {
            break;
        }
    }

    // Below the threshold but above threshold * resume_ratio keeps dispatch paused
    tokio::time::sleep(Duration::from_millis(30)).await;
    probe.set_pressure(0.6);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(handle.current_state().is_paused);
    probe.set_pressure(0.3);

    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    let report = run.await.unwrap().unwrap();

    assert!(report.success);
    assert_eq!(report.data, 8);
    assert_eq!(report.metrics.backpressure_events, 1);

    let detected_at = seen
        .iter()
        .position(|e| matches!(e, PipelineEvent::BackpressureDetected { pressure, .. } if *pressure > 0.7))
        .unwrap();
    let resumed_at = seen
        .iter()
        .position(|e| {
            matches!(
                e,
                PipelineEvent::Resumed {
                    reason: PauseReason::Backpressure
                }
            )
        })
        .unwrap();
    assert!(detected_at < resumed_at);
    assert!(matches!(
        seen[detected_at + 1],
        PipelineEvent::Paused {
            reason: PauseReason::Backpressure
        }
    ));
    assert_eq!(count(&seen[detected_at..resumed_at], "chunk-processing-started"), 0);
}

#[tokio::test]
async fn test_cancel_after_two_chunks() {
    let extractor = from_fn(|bytes: &[u8], _, _: &ChunkMetadata| {
        sleep_ms(20);
        Ok(bytes.len())
    });
    let mut pipeline = StreamingPipeline::with_extractor(test_config(1, 1), extractor)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();
    let handle = pipeline.handle();

    let run = tokio::spawn(pipeline.run(vec![0u8; 10]));

    let mut completed = 0;
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        if matches!(event, PipelineEvent::ChunkCompleted { .. }) {
            completed += 1;
            if completed == 2 {
                handle.cancel();
            }
        }
        seen.push(event);
    }

    let result = run.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(count(&seen, "cancelled"), 1);
    assert_eq!(count(&seen, "completed"), 0);
    assert!(count(&seen, "chunk-processing-completed") < 10);

    let state = handle.current_state();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert!(!state.is_complete);
    assert_eq!(state.chunks_in_progress, 0);
    assert_eq!(handle.live_workers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_chunk_starts_after_cancel() {
    let cancel_from: Arc<OnceLock<PipelineHandle>> = Arc::new(OnceLock::new());
    let extractor = {
        let cancel_from = cancel_from.clone();
        from_fn(move |bytes: &[u8], _, meta: &ChunkMetadata| {
            sleep_ms(5);
            if meta.index == 1 {
                if let Some(handle) = cancel_from.get() {
                    handle.cancel();
                }
            }
            Ok(bytes.len())
        })
    };
    let mut pipeline = StreamingPipeline::with_extractor(test_config(1, 1), extractor)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();
    let handle = pipeline.handle();
    assert!(cancel_from.set(pipeline.handle()).is_ok());

    let result = pipeline.run(vec![0u8; 10]).await;
    assert!(matches!(result, Err(Error::Cancelled)));

    let events = drain(&mut events);
    // Chunk 1 cancels while it is the only chunk in flight
    let started: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::ChunkStarted { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![0, 1]);
    let cancelled_at = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::Cancelled))
        .unwrap();
    assert_eq!(count(&events[cancelled_at..], "chunk-processing-started"), 0);
    assert_eq!(handle.live_workers(), 0);
}

#[tokio::test]
async fn test_running_chunks_never_exceed_concurrency() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let extractor = {
        let (running, peak) = (running.clone(), peak.clone());
        from_fn(move |bytes: &[u8], _, _: &ChunkMetadata| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            sleep_ms(5);
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(bytes.len())
        })
    };
    let mut pipeline = StreamingPipeline::with_extractor(test_config(2, 3), extractor)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();

    let report = pipeline.run(vec![1u8; 40]).await.unwrap();

    assert!(report.success);
    assert!(peak.load(Ordering::SeqCst) <= 3);

    let mut in_progress = 0i64;
    for event in drain(&mut events) {
        match event {
            PipelineEvent::ChunkStarted { .. } => in_progress += 1,
            PipelineEvent::ChunkCompleted { .. }
            | PipelineEvent::ChunkRetry { .. }
            | PipelineEvent::ChunkFailed { .. } => in_progress -= 1,
            PipelineEvent::Progress(state) => {
                assert!(state.chunks_in_progress <= 3);
                assert!(
                    state.chunks_processed + state.chunks_in_progress + state.chunks_failed
                        <= state.chunks_total
                );
            }
            _ => {}
        }
        assert!(in_progress <= 3);
    }
}

#[tokio::test]
async fn test_results_ordered_by_index_not_completion() {
    let extractor = from_fn(|bytes: &[u8], _, meta: &ChunkMetadata| {
        // Later chunks finish first
        sleep_ms(5 * (9 - meta.index as u64));
        Ok(String::from_utf8_lossy(bytes).into_owned())
    });
    let mut pipeline = StreamingPipeline::with_extractor(test_config(3, 6), extractor)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();

    let input = "the quick brown fox jumps";
    let report = pipeline.run(input.as_bytes().to_vec()).await.unwrap();

    assert_eq!(report.data, input);
    let completion_order: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::ChunkCompleted { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(completion_order.len(), 9);
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    let extractor = from_fn(|bytes: &[u8], _, meta: &ChunkMetadata| {
        if meta.index == 3 && meta.attempt == 1 {
            panic!("extractor state corrupted");
        }
        Ok(bytes.len())
    });
    let mut pipeline = StreamingPipeline::with_extractor(test_config(2, 2), extractor)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();

    let report = pipeline.run(vec![0u8; 12]).await.unwrap();

    assert!(report.success);
    assert_eq!(report.data, 12);
    assert_eq!(report.chunks[3].attempts, 2);
    assert_eq!(report.metrics.workers_replaced, 1);

    let events = drain(&mut events);
    assert_eq!(count(&events, "worker-replaced"), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::ChunkRetry { error, .. } if error.contains("crashed")
    )));
}

#[tokio::test]
async fn test_slow_chunk_times_out_and_is_retried() {
    let extractor = from_fn(|bytes: &[u8], _, meta: &ChunkMetadata| {
        if meta.index == 1 && meta.attempt == 1 {
            sleep_ms(200);
        }
        Ok(bytes.len())
    });
    let mut config = test_config(2, 1);
    config.processing.chunk_timeout_ms = Some(30);
    let pipeline =
        StreamingPipeline::with_extractor(config, extractor).with_memory_probe(calm_probe());

    let report = pipeline.run(vec![0u8; 6]).await.unwrap();

    assert!(report.success);
    assert_eq!(report.chunks[1].attempts, 2);
    assert_eq!(report.metrics.chunk_timeouts, 1);
    assert_eq!(report.metrics.workers_replaced, 1);
}

#[tokio::test]
async fn test_losing_every_worker_aborts_the_run() {
    let built = Arc::new(AtomicUsize::new(0));
    let factory = {
        let built = built.clone();
        move || {
            if built.fetch_add(1, Ordering::SeqCst) >= 2 {
                return Err(ExtractError::permanent("out of licenses"));
            }
            Ok(from_fn(|_: &[u8], _, _: &ChunkMetadata| -> Result<usize, ExtractError> {
                panic!("always crashes")
            }))
        }
    };
    let pipeline = StreamingPipeline::new(test_config(1, 2), factory).with_memory_probe(calm_probe());
    let handle = pipeline.handle();

    let result = pipeline.run(vec![0u8; 4]).await;

    assert!(matches!(result, Err(Error::WorkerPool(_))));
    assert_eq!(handle.current_state().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_failing_factory_is_initialization_error() {
    let pipeline = StreamingPipeline::new(test_config(1, 2), || {
        Err::<ByteCounter, _>(ExtractError::permanent("model file missing"))
    });
    let result = pipeline.run(vec![0u8; 4]).await;
    assert!(matches!(result, Err(Error::Initialization(_))));
}

#[tokio::test]
async fn test_chain_dependencies_run_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let extractor = {
        let order = order.clone();
        from_fn(move |bytes: &[u8], _, meta: &ChunkMetadata| {
            order.lock().unwrap().push(meta.index);
            sleep_ms(2);
            Ok(bytes.len())
        })
    };
    let mut config = test_config(1, 4);
    config.chunking.dependencies = DependencyRule::Chain;
    config.chunking.dependency_policy = DependencyPolicy::Strict;
    let pipeline =
        StreamingPipeline::with_extractor(config, extractor).with_memory_probe(calm_probe());

    let report = pipeline.run(vec![0u8; 8]).await.unwrap();

    assert!(report.success);
    assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_anchor_dependency_waits_for_chunk_zero() {
    let extractor = from_fn(|bytes: &[u8], _, meta: &ChunkMetadata| {
        if meta.index == 0 {
            sleep_ms(30);
        }
        Ok(bytes.len())
    });
    let mut config = test_config(1, 4);
    config.chunking.dependencies = DependencyRule::Anchor { every: 3 };
    config.chunking.dependency_policy = DependencyPolicy::Strict;
    let mut pipeline =
        StreamingPipeline::with_extractor(config, extractor).with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();

    let report = pipeline.run(vec![0u8; 7]).await.unwrap();
    assert!(report.success);

    let events = drain(&mut events);
    let zero_done = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::ChunkCompleted { index: 0, .. }))
        .unwrap();
    for dependent in [3usize, 6] {
        let started = events
            .iter()
            .position(|e| matches!(e, PipelineEvent::ChunkStarted { index, .. } if *index == dependent))
            .unwrap();
        assert!(started > zero_done);
    }
}

#[tokio::test]
async fn test_incremental_planning_applies_adaptive_size() {
    let extractor = from_fn(|bytes: &[u8], _, _: &ChunkMetadata| {
        sleep_ms(5);
        Ok(bytes.len())
    });
    let mut config = test_config(1000, 1);
    config.chunking.min_chunk_size = 100;
    config.chunking.max_chunk_size = 4000;
    config.chunking.enable_adaptive_chunking = true;
    config.chunking.incremental = true;
    config.chunking.target_chunk_time_ms = 50;
    let mut pipeline =
        StreamingPipeline::with_extractor(config, extractor).with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();

    let report = pipeline.run(vec![0u8; 20_000]).await.unwrap();

    assert!(report.success);
    assert_eq!(report.data, 20_000);
    assert_eq!(report.chunks[0].size, 1000);
    assert!(report.chunks.iter().skip(1).any(|c| c.size > 1000));
    assert!(report.chunks.iter().all(|c| c.size <= 4000));
    assert!(report.recommended_chunk_size > 1000);
    assert!(report.metrics.adaptive_adjustments >= 1);
    assert_eq!(report.metrics.chunk_size_history.first(), Some(&1000));

    let covered: u64 = report.chunks.iter().map(|c| c.size as u64).sum();
    assert_eq!(covered, 20_000);
    assert!(count(&drain(&mut events), "chunk-size-adjusted") >= 1);
}

#[tokio::test]
async fn test_user_pause_and_resume() {
    let extractor = from_fn(|bytes: &[u8], _, _: &ChunkMetadata| {
        sleep_ms(15);
        Ok(bytes.len())
    });
    let mut pipeline = StreamingPipeline::with_extractor(test_config(1, 1), extractor)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();
    let handle = pipeline.handle();

    let run = tokio::spawn(pipeline.run(vec![0u8; 6]));

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let first_done = matches!(event, PipelineEvent::ChunkCompleted { index: 0, .. });
        seen.push(event);
        if first_done {
            assert!(handle.pause());
            break;
        }
    }

    let paused = handle.wait_for(|s| s.is_paused).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(handle.resume());

    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.data, 6);

    let paused_at = seen
        .iter()
        .position(|e| matches!(e, PipelineEvent::Paused { reason: PauseReason::User }))
        .unwrap();
    let resumed_at = seen
        .iter()
        .position(|e| matches!(e, PipelineEvent::Resumed { reason: PauseReason::User }))
        .unwrap();
    assert_eq!(count(&seen[paused_at..resumed_at], "chunk-processing-started"), 0);
}

#[tokio::test]
async fn test_progress_and_final_state() {
    let extractor = from_fn(|bytes: &[u8], _, _: &ChunkMetadata| {
        sleep_ms(10);
        Ok(bytes.len())
    });
    let mut pipeline = StreamingPipeline::with_extractor(test_config(1, 1), extractor)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();
    let handle = pipeline.handle();

    let report = pipeline.run(vec![0u8; 8]).await.unwrap();

    let events = drain(&mut events);
    assert!(count(&events, "progress") >= 2);

    let state = handle.current_state();
    assert!(state.is_complete);
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.processed_size, 8);
    assert_eq!(state.progress_percent(), 100.0);
    assert_eq!(state.estimated_time_remaining, Some(Duration::ZERO));
    assert_eq!(handle.current_metrics().chunks_completed, 8);
    assert!(report.processing_info.peak_throughput > 0.0);
    assert!(!report.metrics.throughput_history.is_empty());
}

#[tokio::test]
async fn test_empty_input() {
    let mut pipeline = StreamingPipeline::with_extractor(test_config(4, 2), ByteCounter)
        .with_memory_probe(calm_probe());
    let mut events = pipeline.subscribe();

    let report = pipeline.run(Bytes::new()).await.unwrap();

    assert!(report.success);
    assert_eq!(report.data, 0);
    assert_eq!(report.processing_info.total_chunks, 0);
    assert!(report.chunks.is_empty());

    let names: Vec<_> = drain(&mut events).iter().map(|e| e.name()).collect();
    assert_eq!(names.first(), Some(&"prepared"));
    assert_eq!(names.last(), Some(&"completed"));
    assert_eq!(report.state.progress_percent(), 100.0);
}
