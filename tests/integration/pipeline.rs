//! End-to-end generation through the executor, request queue, and prompt generator

use crate::integration::support::{assembler, jobs, project_store, ScriptedBackend, PROJECT};
use scribe::executor::{
    drain_stream_with, ExecutionRequest, ExecutionResult, RequestExecutor, StreamOutcome,
};
use scribe::generation::{
    BatchOrchestrator, GeneratedDocument, JsonDirPersistence, MemoryPersistence,
    OrchestratorConfig, PromptBatchGenerator,
};
use scribe::progress::{ignore_progress, AbortSignal};
use scribe::provider::{BackendError, Completion};
use scribe::queue::{QueueConfig, RequestQueue};
use scribe::tokens::TokenEstimator;
use scribe::types::{JobId, ProjectId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

fn reply(ids: &[&str]) -> Result<Completion, BackendError> {
    let items: Vec<_> = ids
        .iter()
        .map(|id| json!({ "id": id, "content": format!("## {}\nGenerated text.", id) }))
        .collect();
    Ok(Completion {
        model: "scripted-model".to_string(),
        ..Completion::new(serde_json::Value::Array(items).to_string())
    })
}

fn executor(backend: Arc<ScriptedBackend>) -> RequestExecutor {
    RequestExecutor::new(backend).with_estimator(TokenEstimator::heuristic())
}

fn queue() -> Arc<RequestQueue> {
    RequestQueue::start(QueueConfig::default())
}

#[tokio::test(start_paused = true)]
async fn bulk_run_writes_one_file_per_job() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        reply(&["doc-1", "doc-2", "doc-3"]),
        // a lone job may come back as plain text
        Ok(Completion::new("Plain methodology text.")),
    ]));
    let queue = queue();
    let generator = Arc::new(PromptBatchGenerator::new(
        Arc::new(executor(Arc::clone(&backend))),
        Arc::clone(&queue),
    ));
    let out = TempDir::new().unwrap();
    let persistence = Arc::new(JsonDirPersistence::new(out.path()).unwrap());
    let orchestrator =
        BatchOrchestrator::new(assembler(project_store()), generator, persistence.clone());

    let summary = orchestrator
        .run(&ProjectId::new(PROJECT), jobs(4), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();
    queue.shutdown().await;

    assert_eq!(summary.total_generated, 4);
    assert_eq!(backend.calls(), 2);

    let raw = std::fs::read_to_string(persistence.path_for(&JobId::new("doc-4"))).unwrap();
    let stored: GeneratedDocument = serde_json::from_str(&raw).unwrap();
    assert_eq!(stored.content, "Plain methodology text.");
    let raw = std::fs::read_to_string(persistence.path_for(&JobId::new("doc-2"))).unwrap();
    let stored: GeneratedDocument = serde_json::from_str(&raw).unwrap();
    assert!(stored.content.starts_with("## doc-2"));
    assert_eq!(stored.model, "scripted-model");
}

#[tokio::test(start_paused = true)]
async fn truncated_reply_bisects_through_the_full_stack() {
    let truncated = Completion {
        finish_reason: Some("length".to_string()),
        ..Completion::new("[{\"id\": \"doc-1\", \"content\": \"cut off")
    };
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(truncated),
        reply(&["doc-1", "doc-2"]),
        reply(&["doc-3"]),
    ]));
    let queue = queue();
    let generator = Arc::new(PromptBatchGenerator::new(
        Arc::new(executor(Arc::clone(&backend))),
        Arc::clone(&queue),
    ));
    let orchestrator = BatchOrchestrator::new(
        assembler(project_store()),
        generator,
        Arc::new(MemoryPersistence::new()),
    );

    let summary = orchestrator
        .run(&ProjectId::new(PROJECT), jobs(3), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();
    queue.shutdown().await;

    assert_eq!(backend.calls(), 3);
    assert_eq!(summary.total_generated, 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_executor_rate_limit_is_retried_by_the_orchestrator() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Err(BackendError::rate_limited("12s")),
        reply(&["doc-1"]),
    ]));
    let queue = queue();
    let generator = Arc::new(
        PromptBatchGenerator::new(Arc::new(executor(Arc::clone(&backend))), Arc::clone(&queue))
            .with_max_retries(0),
    );
    let orchestrator = BatchOrchestrator::new(
        assembler(project_store()),
        generator,
        Arc::new(MemoryPersistence::new()),
    );

    let started = Instant::now();
    let summary = orchestrator
        .run(&ProjectId::new(PROJECT), jobs(1), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();
    queue.shutdown().await;

    assert_eq!(summary.total_generated, 1);
    assert_eq!(backend.calls(), 2);
    assert!(started.elapsed() >= Duration::from_secs(12));
}

#[tokio::test(start_paused = true)]
async fn run_wait_ceiling_covers_executor_sleeps() {
    let backend = Arc::new(ScriptedBackend::new(
        (0..10).map(|_| Err(BackendError::rate_limited("300s"))).collect(),
    ));
    let queue = queue();
    let config = OrchestratorConfig::default();
    let wait_budget = config.rate_limit_budget();
    let generator = Arc::new(PromptBatchGenerator::new(
        Arc::new(executor(Arc::clone(&backend)).with_rate_limit_budget(wait_budget.clone())),
        Arc::clone(&queue),
    ));
    let orchestrator = BatchOrchestrator::new(
        assembler(project_store()),
        generator,
        Arc::new(MemoryPersistence::new()),
    )
    .with_config(config)
    .with_rate_limit_budget(wait_budget.clone());

    let started = Instant::now();
    let summary = orchestrator
        .run(&ProjectId::new(PROJECT), jobs(1), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();
    queue.shutdown().await;

    // three 300s executor waits fill the 900s ceiling; nothing further is slept
    assert_eq!(summary.total_failed, 1);
    assert_eq!(backend.calls(), 4);
    assert_eq!(wait_budget.spent(), Duration::from_secs(900));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(900) && elapsed < Duration::from_secs(901));
}

#[tokio::test(start_paused = true)]
async fn hour_long_retry_hint_fails_the_job_without_waiting() {
    let backend = Arc::new(ScriptedBackend::new(
        (0..5).map(|_| Err(BackendError::rate_limited("3600s"))).collect(),
    ));
    let queue = queue();
    let wait_budget = OrchestratorConfig::default().rate_limit_budget();
    let generator = Arc::new(PromptBatchGenerator::new(
        Arc::new(executor(Arc::clone(&backend)).with_rate_limit_budget(wait_budget.clone())),
        Arc::clone(&queue),
    ));
    let orchestrator = BatchOrchestrator::new(
        assembler(project_store()),
        generator,
        Arc::new(MemoryPersistence::new()),
    )
    .with_rate_limit_budget(wait_budget);

    let started = Instant::now();
    let summary = orchestrator
        .run(&ProjectId::new(PROJECT), jobs(1), &ignore_progress, &AbortSignal::new())
        .await
        .unwrap();
    queue.shutdown().await;

    assert_eq!(summary.total_failed, 1);
    assert_eq!(backend.calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(summary
        .failure_reason(&JobId::new("doc-1"))
        .unwrap()
        .contains("3600 seconds"));
}

#[tokio::test(start_paused = true)]
async fn repeated_429_surfaces_the_server_retry_delay() {
    let backend = Arc::new(ScriptedBackend::new(
        (0..5).map(|_| Err(BackendError::rate_limited("12s"))).collect(),
    ));
    let executor = executor(Arc::clone(&backend));
    let request = ExecutionRequest::new("Summarise the project.", "test").with_max_retries(4);

    let started = Instant::now();
    let result = executor.execute(&request).await;

    assert!(result.is_rate_limit_error());
    assert_eq!(result.retry_delay_seconds(), Some(12));
    assert_eq!(backend.calls(), 5);
    // four waits of ~12s between the five attempts
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(48) && elapsed < Duration::from_secs(49));
}

#[tokio::test(start_paused = true)]
async fn single_429_then_success() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Err(BackendError::rate_limited("12s")),
        Ok(Completion::new("done")),
    ]));
    let executor = executor(Arc::clone(&backend));

    let started = Instant::now();
    let result = executor
        .execute(&ExecutionRequest::new("prompt", "test"))
        .await;

    assert_eq!(result.completion().map(|c| c.text.as_str()), Some("done"));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(12) && elapsed < Duration::from_secs(13));
}

#[tokio::test]
async fn oversized_prompt_is_refused_before_the_network() {
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(Completion::new("unused"))]));
    let executor = executor(Arc::clone(&backend));

    let result = executor
        .execute(&ExecutionRequest::new("x".repeat(280_000), "test"))
        .await;

    match result {
        ExecutionResult::TokenLimitExceeded { estimated, limit } => {
            assert_eq!(estimated, 70_000);
            assert_eq!(limit, 64_000);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn stream_chunks_arrive_in_order() {
    let backend = Arc::new(ScriptedBackend::streaming(&["Hello ", "from ", "scribe"]));
    let executor = executor(Arc::clone(&backend));

    let stream = executor
        .execute_stream(&ExecutionRequest::new("Say hello", "stream"))
        .await
        .unwrap();
    let mut seen = Vec::new();
    let outcome = drain_stream_with(stream, &AbortSignal::new(), |chunk| {
        seen.push(chunk.to_string())
    })
    .await;

    assert_eq!(seen, vec!["Hello ", "from ", "scribe"]);
    assert_eq!(outcome, StreamOutcome::Complete("Hello from scribe".to_string()));
}
