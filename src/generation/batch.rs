//! Batch generation seam.
//!
//! The orchestrator hands a batch of jobs to a [`BatchGenerator`] and branches on the
//! returned [`BatchOutcome`]. [`PromptBatchGenerator`] renders the whole batch into one
//! prompt, sends it through the request queue, and attributes the JSON reply by job id.

use super::plan::{GeneratedDocument, GenerationJob};
use crate::context::ProjectContext;
use crate::error::ApiError;
use crate::executor::{ExecutionRequest, ExecutionResult, RequestExecutor, DEFAULT_MAX_RETRIES};
use crate::queue::RequestQueue;
use crate::types::JobId;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-job results of a completed batch, keyed by job id.
pub type JobResults = HashMap<JobId, Result<GeneratedDocument, String>>;

/// Batch-level outcome of one generation attempt
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    /// The backend answered; each job has its own result. Jobs absent from the map failed.
    Completed(JobResults),
    /// The batch is too large for one request and should be bisected.
    Overflow { reason: String },
    RateLimited { retry_delay: Duration, reason: String },
    /// Any other batch-level failure; every member fails with `message`.
    Failed { message: String },
}

#[async_trait]
pub trait BatchGenerator: Send + Sync {
    async fn generate(&self, context: &ProjectContext, jobs: &[GenerationJob]) -> BatchOutcome;
}

const BATCH_SYSTEM_INSTRUCTION: &str = "You write sections of formal proposal documents. \
Use the supplied project background as your only source of facts. \
Reply with JSON only.";

/// Generator that sends one prompt per batch through the shared request queue.
pub struct PromptBatchGenerator {
    executor: Arc<RequestExecutor>,
    queue: Arc<RequestQueue>,
    temperature: f32,
    max_retries: u32,
}

impl PromptBatchGenerator {
    pub fn new(executor: Arc<RequestExecutor>, queue: Arc<RequestQueue>) -> Self {
        Self {
            executor,
            queue,
            temperature: 0.7,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn outcome_from(result: Result<ExecutionResult, ApiError>, jobs: &[GenerationJob]) -> BatchOutcome {
        let result = match result {
            Ok(result) => result,
            Err(e) => return BatchOutcome::Failed { message: e.to_string() },
        };
        let reason = result.failure_reason();
        match result {
            ExecutionResult::Success(completion) => {
                if completion.is_truncated() {
                    return BatchOutcome::Overflow {
                        reason: format!(
                            "Response truncated (finish reason {})",
                            completion.finish_reason.as_deref().unwrap_or("unknown")
                        ),
                    };
                }
                match parse_batch_response(&completion.text, jobs, &completion.model) {
                    Ok(results) => BatchOutcome::Completed(results),
                    // A lone job can still use a reply that ignored the JSON format.
                    Err(_) if jobs.len() == 1 && !completion.text.trim().is_empty() => {
                        let job = &jobs[0];
                        let document = document_for(job, completion.text.trim(), &completion.model);
                        BatchOutcome::Completed(HashMap::from([(job.id.clone(), Ok(document))]))
                    }
                    Err(message) if jobs.len() > 1 => {
                        warn!(jobs = jobs.len(), error = %message, "Malformed batch response, bisecting");
                        BatchOutcome::Overflow { reason: message }
                    }
                    Err(message) => BatchOutcome::Failed { message },
                }
            }
            ExecutionResult::TokenLimitExceeded { .. } => BatchOutcome::Overflow {
                reason: reason.unwrap_or_default(),
            },
            ExecutionResult::RateLimited { retry_delay, .. } => BatchOutcome::RateLimited {
                retry_delay,
                reason: reason.unwrap_or_default(),
            },
            ExecutionResult::Transient { message } => BatchOutcome::Failed { message },
        }
    }
}

#[async_trait]
impl BatchGenerator for PromptBatchGenerator {
    async fn generate(&self, context: &ProjectContext, jobs: &[GenerationJob]) -> BatchOutcome {
        let prompt = render_batch_prompt(context, jobs);
        let request = ExecutionRequest::new(prompt, "batch")
            .with_system_instruction(BATCH_SYSTEM_INSTRUCTION)
            .with_temperature(self.temperature)
            .with_max_retries(self.max_retries);

        let item_id = jobs
            .iter()
            .map(|job| job.id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        debug!(jobs = jobs.len(), item_id = %item_id, "Submitting batch");

        let executor = Arc::clone(&self.executor);
        let result = self
            .queue
            .enqueue(item_id, move || async move { executor.execute(&request).await })
            .await;

        Self::outcome_from(result, jobs)
    }
}

/// Render the project context and every job into one prompt.
pub fn render_batch_prompt(context: &ProjectContext, jobs: &[GenerationJob]) -> String {
    let mut prompt = context.render();
    prompt.push_str("\n# Task\n");
    prompt.push_str(&format!(
        "Write the {} document(s) below. Respond with only a JSON array containing one object per document:\n",
        jobs.len()
    ));
    prompt.push_str("[{\"id\": \"<document id>\", \"content\": \"<markdown text>\"}]\n");
    prompt.push_str(
        "If a document cannot be written, use {\"id\": \"<document id>\", \"error\": \"<reason>\"} instead.\n",
    );

    for job in jobs {
        let inputs = &job.inputs;
        prompt.push_str(&format!("\n## Document {}\n", job.id));
        prompt.push_str(&format!("Type: {}\n", inputs.document_type));
        if !inputs.requirements.is_empty() {
            prompt.push_str("Requirements:\n");
            for requirement in &inputs.requirements {
                prompt.push_str(&format!("- {}\n", requirement));
            }
        }
        if !inputs.themes.is_empty() {
            prompt.push_str(&format!("Themes: {}\n", inputs.themes.join(", ")));
        }
        if let Some(instructions) = &inputs.instructions {
            prompt.push_str(&format!("Instructions: {}\n", instructions));
        }
    }
    prompt
}

#[derive(Debug, Deserialize)]
struct BatchItem {
    id: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn document_for(job: &GenerationJob, content: &str, model: &str) -> GeneratedDocument {
    GeneratedDocument {
        job_id: job.id.clone(),
        document_type: job.inputs.document_type.clone(),
        content: content.to_string(),
        model: model.to_string(),
        generated_at: Utc::now(),
    }
}

// Slice out the outermost JSON array, ignoring code fences and surrounding prose.
fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

/// Attribute a batch reply to jobs by id.
///
/// Every job in `jobs` gets an entry: its content, its reported error, or a failure for
/// being absent from the reply. Ids not in the batch are ignored.
pub fn parse_batch_response(
    text: &str,
    jobs: &[GenerationJob],
    model: &str,
) -> Result<JobResults, String> {
    let array = extract_json_array(text).ok_or_else(|| "Batch response contains no JSON array".to_string())?;
    let items: Vec<BatchItem> =
        serde_json::from_str(array).map_err(|e| format!("Batch response is not valid JSON: {}", e))?;

    let expected: HashSet<&str> = jobs.iter().map(|job| job.id.as_str()).collect();
    let mut by_id: HashMap<String, BatchItem> = HashMap::with_capacity(items.len());
    for item in items {
        if !expected.contains(item.id.as_str()) {
            warn!(job_id = %item.id, "Ignoring unknown id in batch response");
            continue;
        }
        by_id.entry(item.id.clone()).or_insert(item);
    }

    let mut results = JobResults::with_capacity(jobs.len());
    for job in jobs {
        let result = match by_id.remove(job.id.as_str()) {
            Some(BatchItem {
                content: Some(content),
                ..
            }) if !content.trim().is_empty() => Ok(document_for(job, &content, model)),
            Some(BatchItem {
                error: Some(error), ..
            }) => Err(error),
            Some(_) => Err("Backend returned empty content".to_string()),
            None => Err("Missing from batch response".to_string()),
        };
        results.insert(job.id.clone(), result);
    }
    Ok(results)
}
