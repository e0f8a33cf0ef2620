use crate::error::ApiError;
use crate::types::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default maximum number of jobs per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 3;

/// Inputs a generator needs to produce one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInputs {
    pub document_type: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    #[serde(flatten)]
    pub inputs: JobInputs,
    #[serde(default)]
    pub status: JobStatus,
}

impl GenerationJob {
    pub fn new(id: impl Into<JobId>, document_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inputs: JobInputs {
                document_type: document_type.into(),
                ..JobInputs::default()
            },
            status: JobStatus::Pending,
        }
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.inputs.requirements = requirements;
        self
    }

    pub fn with_themes(mut self, themes: Vec<String>) -> Self {
        self.inputs.themes = themes;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.inputs.instructions = Some(instructions.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, JobStatus::Pending)
    }
}

/// Reject empty or duplicate job ids before a run starts.
pub fn validate_jobs(jobs: &[GenerationJob]) -> Result<(), ApiError> {
    let mut seen = HashSet::with_capacity(jobs.len());
    for job in jobs {
        if job.id.as_str().trim().is_empty() {
            return Err(ApiError::InvalidJob("Job id cannot be empty".to_string()));
        }
        if job.inputs.document_type.trim().is_empty() {
            return Err(ApiError::InvalidJob(format!(
                "Job {} has no document type",
                job.id
            )));
        }
        if !seen.insert(&job.id) {
            return Err(ApiError::InvalidJob(format!("Duplicate job id: {}", job.id)));
        }
    }
    Ok(())
}

/// Document produced for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub job_id: JobId,
    pub document_type: String,
    pub content: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
}

/// Ordered group of job ids submitted together.
///
/// `origin` is the 1-based index of the batch it was formed as; sub-batches produced by
/// [`Batch::split`] keep their parent's origin and record their depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub origin: usize,
    pub depth: usize,
    pub job_ids: Vec<JobId>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.job_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job_ids.is_empty()
    }

    /// Bisect into `(ceil(n/2), floor(n/2))` halves. `None` for batches of one or zero.
    pub fn split(&self) -> Option<(Batch, Batch)> {
        if self.job_ids.len() < 2 {
            return None;
        }
        let mid = self.job_ids.len().div_ceil(2);
        let (left, right) = self.job_ids.split_at(mid);
        let half = |ids: &[JobId]| Batch {
            origin: self.origin,
            depth: self.depth + 1,
            job_ids: ids.to_vec(),
        };
        Some((half(left), half(right)))
    }
}

/// Partition ids into consecutive batches of at most `max_batch_size` (minimum 1).
pub fn partition(job_ids: &[JobId], max_batch_size: usize) -> Vec<Batch> {
    job_ids
        .chunks(max_batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| Batch {
            origin: i + 1,
            depth: 0,
            job_ids: chunk.to_vec(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub reason: String,
}

/// Outcome of a bulk run. Every input job appears exactly once in `succeeded` or `failed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub succeeded: Vec<JobId>,
    pub failed: Vec<JobFailure>,
    pub total_generated: usize,
    pub total_failed: usize,
    /// Jobs in input order with their terminal status.
    pub jobs: Vec<GenerationJob>,
}

impl RunSummary {
    pub fn from_jobs(jobs: Vec<GenerationJob>) -> Self {
        let mut summary = RunSummary::default();
        for job in &jobs {
            match &job.status {
                JobStatus::Succeeded => summary.succeeded.push(job.id.clone()),
                JobStatus::Failed { reason } => summary.failed.push(JobFailure {
                    job_id: job.id.clone(),
                    reason: reason.clone(),
                }),
                JobStatus::Pending => summary.failed.push(JobFailure {
                    job_id: job.id.clone(),
                    reason: "job was never processed".to_string(),
                }),
            }
        }
        summary.total_generated = summary.succeeded.len();
        summary.total_failed = summary.failed.len();
        summary.jobs = jobs;
        summary
    }

    pub fn failure_reason(&self, job_id: &JobId) -> Option<&str> {
        self.failed
            .iter()
            .find(|f| &f.job_id == job_id)
            .map(|f| f.reason.as_str())
    }
}
