//! Batch orchestrator: runs a job list against a project context.
//!
//! Batches are processed strictly one after another from an explicit work list. An
//! overflowing batch is replaced by its two halves at the front of the list, a
//! rate-limited batch is put back after a wait, and every other outcome is recorded per
//! job. The run ends with every job terminal.

use super::batch::{BatchGenerator, BatchOutcome, JobResults};
use super::persistence::Persistence;
use super::plan::{
    partition, validate_jobs, Batch, GenerationJob, JobStatus, RunSummary, DEFAULT_MAX_BATCH_SIZE,
};
use crate::context::{AssembleOptions, ContextAssembler, ProjectContext};
use crate::error::ApiError;
use crate::progress::{AbortSignal, ProgressCallback, ProgressEvent, ProgressPhase, RateLimitBudget};
use crate::types::{JobId, ProjectId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Reason recorded for jobs that were never submitted because the run was aborted.
pub const ABORTED_REASON: &str = "run aborted";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_batch_size: usize,
    /// Pause after each successful batch (milliseconds)
    pub inter_batch_delay_ms: u64,
    /// Rate-limit retries of the same batch before its members fail
    pub max_rate_limit_retries: u32,
    /// Cumulative rate-limit wait allowed across one run (seconds), executor waits included
    /// when the executor shares the run's [`RateLimitBudget`]
    pub max_total_rate_limit_wait_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            inter_batch_delay_ms: 5_000,
            max_rate_limit_retries: 3,
            max_total_rate_limit_wait_secs: 900,
        }
    }
}

impl OrchestratorConfig {
    fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    /// A fresh wait budget sized from this config.
    pub fn rate_limit_budget(&self) -> RateLimitBudget {
        RateLimitBudget::new(Duration::from_secs(self.max_total_rate_limit_wait_secs))
    }
}

// Whole seconds, rounded up, for progress messages.
fn display_secs(delay: Duration) -> u128 {
    delay.as_millis().div_ceil(1000)
}

struct PendingBatch {
    batch: Batch,
    rate_limit_retries: u32,
}

// Mutable bookkeeping for one run
struct RunState<'a> {
    jobs: Vec<GenerationJob>,
    index: HashMap<JobId, usize>,
    completed: usize,
    total_batches: usize,
    on_progress: ProgressCallback<'a>,
}

impl<'a> RunState<'a> {
    fn new(jobs: Vec<GenerationJob>, on_progress: ProgressCallback<'a>) -> Self {
        let index = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| (job.id.clone(), i))
            .collect();
        Self {
            jobs,
            index,
            completed: 0,
            total_batches: 0,
            on_progress,
        }
    }

    fn jobs_for(&self, batch: &Batch) -> Vec<GenerationJob> {
        batch
            .job_ids
            .iter()
            .filter_map(|id| self.index.get(id).map(|&i| self.jobs[i].clone()))
            .collect()
    }

    // Terminal statuses are final; a second call for the same job is ignored.
    fn finish(&mut self, job_id: &JobId, status: JobStatus) {
        if let Some(&i) = self.index.get(job_id) {
            let job = &mut self.jobs[i];
            if job.is_terminal() {
                return;
            }
            if let JobStatus::Failed { reason } = &status {
                debug!(job_id = %job_id, reason = %reason, "Job failed");
            }
            job.status = status;
            self.completed += 1;
        }
    }

    fn fail_all(&mut self, job_ids: &[JobId], reason: &str) {
        for id in job_ids {
            self.finish(
                id,
                JobStatus::Failed {
                    reason: reason.to_string(),
                },
            );
        }
    }

    fn emit(&self, phase: ProgressPhase, batch_index: usize, message: String, in_flight: &[JobId]) {
        let event = ProgressEvent {
            phase,
            batch_index,
            total_batches: self.total_batches,
            completed: self.completed,
            total: self.jobs.len(),
            message,
            in_flight: in_flight.to_vec(),
        };
        (self.on_progress)(&event);
    }
}

/// Drives bulk generation for one project.
pub struct BatchOrchestrator {
    assembler: Arc<ContextAssembler>,
    generator: Arc<dyn BatchGenerator>,
    persistence: Arc<dyn Persistence>,
    config: OrchestratorConfig,
    rate_limit_budget: Option<RateLimitBudget>,
}

impl BatchOrchestrator {
    pub fn new(
        assembler: Arc<ContextAssembler>,
        generator: Arc<dyn BatchGenerator>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            assembler,
            generator,
            persistence,
            config: OrchestratorConfig::default(),
            rate_limit_budget: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Draw rate-limit waits from `budget` instead of a per-run budget built from config.
    /// Share it with the executor so in-call waits count against the same ceiling.
    pub fn with_rate_limit_budget(mut self, budget: RateLimitBudget) -> Self {
        self.rate_limit_budget = Some(budget);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Generate every job and report per-job outcomes.
    ///
    /// Returns `Err` only when the job list is invalid or the project context cannot be
    /// fetched; generation failures are reported per job in the summary.
    pub async fn run(
        &self,
        project_id: &ProjectId,
        jobs: Vec<GenerationJob>,
        on_progress: ProgressCallback<'_>,
        abort: &AbortSignal,
    ) -> Result<RunSummary, ApiError> {
        validate_jobs(&jobs)?;
        let mut state = RunState::new(jobs, on_progress);

        if state.jobs.is_empty() {
            state.emit(ProgressPhase::Completed, 0, "No jobs to generate".to_string(), &[]);
            return Ok(RunSummary::from_jobs(state.jobs));
        }

        let context = self
            .assembler
            .assemble(project_id, AssembleOptions::default())
            .await?;
        let validation = self.assembler.validate(&context);
        if !validation.valid {
            let reason = validation
                .warning
                .unwrap_or_else(|| "Project context exceeds the token limit".to_string());
            warn!(project_id = %project_id, tokens = validation.token_estimate, "Context too large, failing run");
            let ids: Vec<JobId> = state.jobs.iter().map(|job| job.id.clone()).collect();
            state.fail_all(&ids, &reason);
            state.emit(ProgressPhase::Completed, 0, reason, &[]);
            return Ok(RunSummary::from_jobs(state.jobs));
        }

        let ids: Vec<JobId> = state.jobs.iter().map(|job| job.id.clone()).collect();
        let batches = partition(&ids, self.config.max_batch_size);
        state.total_batches = batches.len();

        info!(
            project_id = %project_id,
            jobs = ids.len(),
            batches = batches.len(),
            max_batch_size = self.config.max_batch_size,
            context_tokens = context.token_estimate,
            "Starting bulk generation"
        );
        state.emit(
            ProgressPhase::Preparing,
            0,
            format!("Generating {} documents in {} batches", ids.len(), batches.len()),
            &[],
        );

        let mut work: VecDeque<PendingBatch> = batches
            .into_iter()
            .map(|batch| PendingBatch {
                batch,
                rate_limit_retries: 0,
            })
            .collect();
        let wait_budget = self
            .rate_limit_budget
            .clone()
            .unwrap_or_else(|| self.config.rate_limit_budget());

        while let Some(pending) = work.pop_front() {
            if abort.is_aborted() {
                let mut remaining = pending.batch.job_ids.clone();
                remaining.extend(work.drain(..).flat_map(|p| p.batch.job_ids));
                state.fail_all(&remaining, ABORTED_REASON);
                info!(skipped_jobs = remaining.len(), "Bulk generation aborted");
                state.emit(
                    ProgressPhase::Aborted,
                    pending.batch.origin,
                    format!("Run aborted, {} jobs not submitted", remaining.len()),
                    &[],
                );
                break;
            }

            let batch = &pending.batch;
            state.emit(
                ProgressPhase::Generating,
                batch.origin,
                format!(
                    "Generating batch {}/{} ({} documents)",
                    batch.origin,
                    state.total_batches,
                    batch.len()
                ),
                &batch.job_ids,
            );

            let batch_jobs = state.jobs_for(batch);
            let outcome = self.generator.generate(&context, &batch_jobs).await;

            match outcome {
                BatchOutcome::Completed(results) => {
                    self.record_results(&mut state, batch, results).await;
                    state.emit(
                        ProgressPhase::BatchCompleted,
                        batch.origin,
                        format!("Batch {}/{} finished", batch.origin, state.total_batches),
                        &[],
                    );
                    if !work.is_empty() && !abort.is_aborted() {
                        let delay = self.config.inter_batch_delay();
                        debug!(delay_ms = delay.as_millis() as u64, "Waiting before next batch");
                        state.emit(
                            ProgressPhase::Waiting,
                            batch.origin,
                            format!("Waiting {}s before the next batch", display_secs(delay)),
                            &[],
                        );
                        sleep(delay).await;
                    }
                }
                BatchOutcome::Overflow { reason } => match batch.split() {
                    Some((left, right)) => {
                        info!(
                            batch = batch.origin,
                            depth = batch.depth,
                            size = batch.len(),
                            left = left.len(),
                            right = right.len(),
                            reason = %reason,
                            "Batch overflowed, splitting"
                        );
                        state.emit(
                            ProgressPhase::Splitting,
                            batch.origin,
                            format!(
                                "Batch {} too large, splitting into {} and {}",
                                batch.origin,
                                left.len(),
                                right.len()
                            ),
                            &[],
                        );
                        work.push_front(PendingBatch {
                            batch: right,
                            rate_limit_retries: 0,
                        });
                        work.push_front(PendingBatch {
                            batch: left,
                            rate_limit_retries: 0,
                        });
                    }
                    None => {
                        warn!(job_ids = ?batch.job_ids, reason = %reason, "Single job exceeds limits");
                        state.fail_all(&batch.job_ids, &reason);
                        state.emit(
                            ProgressPhase::BatchCompleted,
                            batch.origin,
                            format!("Document too large to generate: {}", reason),
                            &[],
                        );
                    }
                },
                BatchOutcome::RateLimited {
                    retry_delay,
                    reason,
                } => {
                    let within_retries = pending.rate_limit_retries < self.config.max_rate_limit_retries;
                    if within_retries && wait_budget.try_spend(retry_delay) {
                        info!(
                            batch = batch.origin,
                            retry = pending.rate_limit_retries + 1,
                            delay_ms = retry_delay.as_millis() as u64,
                            total_wait_ms = wait_budget.spent().as_millis() as u64,
                            "Batch rate limited, waiting before retry"
                        );
                        state.emit(
                            ProgressPhase::RateLimitWait,
                            batch.origin,
                            format!(
                                "Rate limited, retrying batch {} in {}s",
                                batch.origin,
                                display_secs(retry_delay)
                            ),
                            &batch.job_ids,
                        );
                        sleep(retry_delay).await;
                        work.push_front(PendingBatch {
                            batch: pending.batch,
                            rate_limit_retries: pending.rate_limit_retries + 1,
                        });
                    } else {
                        warn!(
                            batch = batch.origin,
                            retries = pending.rate_limit_retries,
                            total_wait_ms = wait_budget.spent().as_millis() as u64,
                            "Rate limit retries exhausted, failing batch"
                        );
                        state.fail_all(&batch.job_ids, &reason);
                        state.emit(
                            ProgressPhase::BatchCompleted,
                            batch.origin,
                            format!("Batch {} failed: {}", batch.origin, reason),
                            &[],
                        );
                    }
                }
                BatchOutcome::Failed { message } => {
                    warn!(batch = batch.origin, error = %message, "Batch failed");
                    state.fail_all(&batch.job_ids, &message);
                    state.emit(
                        ProgressPhase::BatchCompleted,
                        batch.origin,
                        format!("Batch {} failed: {}", batch.origin, message),
                        &[],
                    );
                }
            }
        }

        let summary = RunSummary::from_jobs(state.jobs.clone());
        info!(
            project_id = %project_id,
            generated = summary.total_generated,
            failed = summary.total_failed,
            "Bulk generation finished"
        );
        state.emit(
            ProgressPhase::Completed,
            state.total_batches,
            format!(
                "{} generated, {} failed",
                summary.total_generated, summary.total_failed
            ),
            &[],
        );
        Ok(summary)
    }

    // Persist successes; anything the generator did not report on fails individually.
    async fn record_results(&self, state: &mut RunState<'_>, batch: &Batch, mut results: JobResults) {
        for job_id in &batch.job_ids {
            let status = match results.remove(job_id) {
                Some(Ok(document)) => match self.persistence.upsert(job_id, &document).await {
                    Ok(()) => JobStatus::Succeeded,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Failed to persist generated document");
                        JobStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                },
                Some(Err(reason)) => JobStatus::Failed { reason },
                None => JobStatus::Failed {
                    reason: "Missing from batch response".to_string(),
                },
            };
            state.finish(job_id, status);
        }
    }

    /// Assemble (or reuse) the context a run would use.
    pub async fn context(&self, project_id: &ProjectId) -> Result<ProjectContext, ApiError> {
        self.assembler
            .assemble(project_id, AssembleOptions::default())
            .await
    }
}
