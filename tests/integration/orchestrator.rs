//! Batch orchestrator runs against scripted generators

use crate::integration::support::{
    assembler, jobs, project_store, FlakyPersistence, ProgressLog, ScriptedGenerator, PROJECT,
};
use scribe::context::{MemoryDocumentStore, ProjectMetadata, SourceDocument};
use scribe::error::ApiError;
use scribe::generation::{
    BatchOrchestrator, BatchOutcome, GenerationJob, JobStatus, MemoryPersistence,
    OrchestratorConfig, ABORTED_REASON,
};
use scribe::progress::{ignore_progress, AbortSignal, ProgressEvent, ProgressPhase};
use scribe::types::{JobId, ProjectId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn orchestrator(
    generator: Arc<ScriptedGenerator>,
    persistence: Arc<dyn scribe::generation::Persistence>,
) -> BatchOrchestrator {
    BatchOrchestrator::new(assembler(project_store()), generator, persistence)
}

fn project() -> ProjectId {
    ProjectId::new(PROJECT)
}

fn ids(names: &[&str]) -> Vec<JobId> {
    names.iter().map(|n| JobId::new(*n)).collect()
}

#[tokio::test(start_paused = true)]
async fn seven_jobs_run_in_three_batches() {
    let generator = Arc::new(ScriptedGenerator::succeeding());
    let persistence = Arc::new(MemoryPersistence::new());
    let orchestrator = orchestrator(Arc::clone(&generator), persistence.clone());
    let log = ProgressLog::default();
    let on_progress = |event: &ProgressEvent| log.record(event);

    let started = Instant::now();
    let summary = orchestrator
        .run(&project(), jobs(7), &on_progress, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(generator.batch_sizes(), vec![3, 3, 1]);

    let events = log.events();
    let trace: Vec<(ProgressPhase, usize, usize)> = events
        .iter()
        .map(|e| (e.phase, e.batch_index, e.completed))
        .collect();
    assert_eq!(
        trace,
        vec![
            (ProgressPhase::Preparing, 0, 0),
            (ProgressPhase::Generating, 1, 0),
            (ProgressPhase::BatchCompleted, 1, 3),
            (ProgressPhase::Waiting, 1, 3),
            (ProgressPhase::Generating, 2, 3),
            (ProgressPhase::BatchCompleted, 2, 6),
            (ProgressPhase::Waiting, 2, 6),
            (ProgressPhase::Generating, 3, 6),
            (ProgressPhase::BatchCompleted, 3, 7),
            (ProgressPhase::Completed, 3, 7),
        ]
    );
    assert!(events.iter().all(|e| e.total == 7 && e.total_batches == 3));
    assert_eq!(events[1].in_flight, ids(&["doc-1", "doc-2", "doc-3"]));
    assert_eq!(events[3].message, "Waiting 5s before the next batch");
    assert_eq!(summary.succeeded.len(), 7);
    assert!(summary.failed.is_empty());
    assert_eq!(summary.total_generated, 7);
    assert_eq!(persistence.len(), 7);

    // two inter-batch pauses of 5s, none after the last batch
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(11));
}

#[tokio::test(start_paused = true)]
async fn overflowing_batch_is_bisected_and_reported_per_job() {
    let generator = Arc::new(ScriptedGenerator::new(|jobs| {
        if jobs.len() == 3 {
            BatchOutcome::Overflow {
                reason: "Request is ~70000 tokens".to_string(),
            }
        } else {
            BatchOutcome::Completed(crate::integration::support::all_succeeded(jobs))
        }
    }));
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()));
    let log = ProgressLog::default();
    let on_progress = |event: &ProgressEvent| log.record(event);

    let summary = orchestrator
        .run(&project(), jobs(3), &on_progress, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(generator.batch_sizes(), vec![3, 2, 1]);

    let trace: Vec<(ProgressPhase, usize)> = log
        .events()
        .iter()
        .map(|e| (e.phase, e.completed))
        .collect();
    assert_eq!(
        trace,
        vec![
            (ProgressPhase::Preparing, 0),
            (ProgressPhase::Generating, 0),
            (ProgressPhase::Splitting, 0),
            (ProgressPhase::Generating, 0),
            (ProgressPhase::BatchCompleted, 2),
            (ProgressPhase::Waiting, 2),
            (ProgressPhase::Generating, 2),
            (ProgressPhase::BatchCompleted, 3),
            (ProgressPhase::Completed, 3),
        ]
    );
    let splitting = log
        .events()
        .into_iter()
        .find(|e| e.phase == ProgressPhase::Splitting)
        .unwrap();
    assert_eq!(splitting.message, "Batch 1 too large, splitting into 2 and 1");
    assert_eq!(generator.batches()[1], ids(&["doc-1", "doc-2"]));
    assert_eq!(generator.batches()[2], ids(&["doc-3"]));
    assert_eq!(summary.succeeded, ids(&["doc-1", "doc-2", "doc-3"]));
    assert!(summary.failed.is_empty());
}

#[tokio::test(start_paused = true)]
async fn single_job_overflow_fails_that_job_only() {
    let generator = Arc::new(ScriptedGenerator::new(|jobs| {
        if jobs.iter().any(|job| job.id.as_str() == "doc-2") {
            BatchOutcome::Overflow {
                reason: "Document exceeds the output limit".to_string(),
            }
        } else {
            BatchOutcome::Completed(crate::integration::support::all_succeeded(jobs))
        }
    }));
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()));

    let summary = orchestrator
        .run(&project(), jobs(3), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();

    // [1,2,3] -> [1,2] -> [1] ok, [2] fails; then [3] ok
    assert_eq!(generator.batch_sizes(), vec![3, 2, 1, 1, 1]);
    assert_eq!(summary.succeeded, ids(&["doc-1", "doc-3"]));
    assert_eq!(
        summary.failure_reason(&JobId::new("doc-2")),
        Some("Document exceeds the output limit")
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limited_batch_waits_and_retries() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let generator = Arc::new(ScriptedGenerator::new(move |jobs| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            BatchOutcome::RateLimited {
                retry_delay: Duration::from_secs(12),
                reason: "Rate limit reached, try again in 12 seconds".to_string(),
            }
        } else {
            BatchOutcome::Completed(crate::integration::support::all_succeeded(jobs))
        }
    }));
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()));
    let log = ProgressLog::default();
    let on_progress = |event: &ProgressEvent| log.record(event);

    let started = Instant::now();
    let summary = orchestrator
        .run(&project(), jobs(2), &on_progress, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.total_generated, 2);
    assert_eq!(generator.batch_sizes(), vec![2, 2]);
    assert!(started.elapsed() >= Duration::from_secs(12));
    assert!(log
        .events()
        .iter()
        .any(|e| e.phase == ProgressPhase::RateLimitWait && e.in_flight.len() == 2));
}

#[tokio::test(start_paused = true)]
async fn sub_second_rate_limit_wait_is_reported_as_one_second() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let generator = Arc::new(ScriptedGenerator::new(move |jobs| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            BatchOutcome::RateLimited {
                retry_delay: Duration::from_millis(400),
                reason: "Rate limit reached, try again in 1 seconds".to_string(),
            }
        } else {
            BatchOutcome::Completed(crate::integration::support::all_succeeded(jobs))
        }
    }));
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()));
    let log = ProgressLog::default();
    let on_progress = |event: &ProgressEvent| log.record(event);

    orchestrator
        .run(&project(), jobs(1), &on_progress, &AbortSignal::new())
        .await
        .unwrap();

    let wait = log
        .events()
        .into_iter()
        .find(|e| e.phase == ProgressPhase::RateLimitWait)
        .unwrap();
    assert_eq!(wait.message, "Rate limited, retrying batch 1 in 1s");
}

#[tokio::test(start_paused = true)]
async fn rate_limit_retries_are_capped() {
    let generator = Arc::new(ScriptedGenerator::new(|_| BatchOutcome::RateLimited {
        retry_delay: Duration::from_secs(60),
        reason: "Rate limit reached, try again in 60 seconds".to_string(),
    }));
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()))
        .with_config(OrchestratorConfig {
            max_rate_limit_retries: 3,
            ..OrchestratorConfig::default()
        });

    let started = Instant::now();
    let summary = orchestrator
        .run(&project(), jobs(1), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(generator.batch_sizes().len(), 4);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(180) && elapsed < Duration::from_secs(181));
    assert_eq!(summary.total_failed, 1);
    assert_eq!(
        summary.failure_reason(&JobId::new("doc-1")),
        Some("Rate limit reached, try again in 60 seconds")
    );
}

#[tokio::test(start_paused = true)]
async fn cumulative_rate_limit_wait_is_bounded() {
    let generator = Arc::new(ScriptedGenerator::new(|_| BatchOutcome::RateLimited {
        retry_delay: Duration::from_secs(60),
        reason: "Rate limit reached, try again in 60 seconds".to_string(),
    }));
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()))
        .with_config(OrchestratorConfig {
            max_batch_size: 1,
            max_rate_limit_retries: 10,
            max_total_rate_limit_wait_secs: 100,
            ..OrchestratorConfig::default()
        });

    let started = Instant::now();
    let summary = orchestrator
        .run(&project(), jobs(2), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();

    // one 60s wait fits the 100s budget; every later wait would exceed it
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(61));
    assert_eq!(generator.batch_sizes(), vec![1, 1, 1]);
    assert_eq!(summary.total_failed, 2);
}

#[tokio::test(start_paused = true)]
async fn abort_fails_jobs_that_were_not_submitted() {
    let generator = Arc::new(ScriptedGenerator::succeeding());
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()));
    let abort = AbortSignal::new();
    let trigger = abort.clone();
    let log = ProgressLog::default();
    let on_progress = |event: &ProgressEvent| {
        if event.phase == ProgressPhase::BatchCompleted {
            trigger.abort();
        }
        log.record(event);
    };

    let started = Instant::now();
    let summary = orchestrator
        .run(&project(), jobs(7), &on_progress, &abort)
        .await
        .unwrap();

    assert_eq!(generator.batch_sizes(), vec![3]);
    assert_eq!(summary.total_generated, 3);
    assert_eq!(summary.total_failed, 4);
    assert!(summary.failed.iter().all(|f| f.reason == ABORTED_REASON));
    // no inter-batch pause once aborted
    assert!(started.elapsed() < Duration::from_secs(1));

    let phases: Vec<ProgressPhase> = log.events().iter().map(|e| e.phase).collect();
    assert!(phases.contains(&ProgressPhase::Aborted));
    assert_eq!(phases.last(), Some(&ProgressPhase::Completed));
}

#[tokio::test(start_paused = true)]
async fn persistence_failure_fails_only_that_job() {
    let generator = Arc::new(ScriptedGenerator::succeeding());
    let persistence = Arc::new(FlakyPersistence::rejecting(&["doc-2"]));
    let orchestrator = orchestrator(Arc::clone(&generator), persistence.clone());

    let summary = orchestrator
        .run(&project(), jobs(3), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, ids(&["doc-1", "doc-3"]));
    assert_eq!(persistence.stored(), 2);
    let reason = summary.failure_reason(&JobId::new("doc-2")).unwrap();
    assert!(reason.contains("disk full"));
}

#[tokio::test(start_paused = true)]
async fn failed_batch_does_not_stop_the_run() {
    let generator = Arc::new(ScriptedGenerator::new(|jobs| {
        if jobs[0].id.as_str() == "doc-1" {
            BatchOutcome::Failed {
                message: "Backend unavailable".to_string(),
            }
        } else {
            BatchOutcome::Completed(crate::integration::support::all_succeeded(jobs))
        }
    }));
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()));

    let summary = orchestrator
        .run(&project(), jobs(5), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(generator.batch_sizes(), vec![3, 2]);
    assert_eq!(summary.succeeded, ids(&["doc-4", "doc-5"]));
    assert_eq!(summary.total_failed, 3);
    assert_eq!(
        summary.failure_reason(&JobId::new("doc-2")),
        Some("Backend unavailable")
    );
}

#[tokio::test(start_paused = true)]
async fn jobs_missing_from_results_fail_individually() {
    let generator = Arc::new(ScriptedGenerator::new(|jobs| {
        let first = &jobs[..1];
        let mut results: HashMap<_, _> = crate::integration::support::all_succeeded(first);
        results.insert(jobs[1].id.clone(), Err("not enough context".to_string()));
        BatchOutcome::Completed(results)
    }));
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()));

    let summary = orchestrator
        .run(&project(), jobs(3), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, ids(&["doc-1"]));
    assert_eq!(
        summary.failure_reason(&JobId::new("doc-2")),
        Some("not enough context")
    );
    assert_eq!(
        summary.failure_reason(&JobId::new("doc-3")),
        Some("Missing from batch response")
    );
    assert!(summary.jobs.iter().all(|job| job.status != JobStatus::Pending));
}

#[tokio::test(start_paused = true)]
async fn oversized_context_fails_every_job_without_generating() {
    let store = Arc::new(MemoryDocumentStore::new());
    store.insert_project(
        ProjectId::new(PROJECT),
        ProjectMetadata::new("Large"),
        vec![SourceDocument::new("Archive", "x".repeat(280_000))],
        Vec::new(),
    );
    let generator = Arc::new(ScriptedGenerator::succeeding());
    let orchestrator = BatchOrchestrator::new(
        assembler(store),
        Arc::clone(&generator) as Arc<dyn scribe::generation::BatchGenerator>,
        Arc::new(MemoryPersistence::new()),
    );

    let summary = orchestrator
        .run(&project(), jobs(4), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();

    assert!(generator.batch_sizes().is_empty());
    assert_eq!(summary.total_failed, 4);
    assert!(summary.failed[0].reason.contains("64,000"));
}

#[tokio::test]
async fn invalid_job_lists_and_unknown_projects_are_errors() {
    let generator = Arc::new(ScriptedGenerator::succeeding());
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()));

    let duplicate = vec![
        GenerationJob::new("same", "section"),
        GenerationJob::new("same", "summary"),
    ];
    let err = orchestrator
        .run(&project(), duplicate, &ignore_progress, &AbortSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidJob(_)));

    let err = orchestrator
        .run(
            &ProjectId::new("missing"),
            jobs(1),
            &ignore_progress,
            &AbortSignal::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::ProjectNotFound(_)));
    assert!(generator.batch_sizes().is_empty());
}

#[tokio::test]
async fn empty_job_list_completes_immediately() {
    let generator = Arc::new(ScriptedGenerator::succeeding());
    let orchestrator = orchestrator(Arc::clone(&generator), Arc::new(MemoryPersistence::new()));

    let summary = orchestrator
        .run(&project(), Vec::new(), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();
    assert_eq!(summary.total_generated, 0);
    assert_eq!(summary.total_failed, 0);
}
