//! Bulk generation: job model, batching, batch generators, persistence, and the orchestrator.

pub mod batch;
pub mod orchestrator;
pub mod persistence;
pub mod plan;

pub use batch::{
    parse_batch_response, render_batch_prompt, BatchGenerator, BatchOutcome, JobResults,
    PromptBatchGenerator,
};
pub use orchestrator::{BatchOrchestrator, OrchestratorConfig, ABORTED_REASON};
pub use persistence::{JsonDirPersistence, MemoryPersistence, Persistence};
pub use plan::{
    partition, validate_jobs, Batch, GeneratedDocument, GenerationJob, JobFailure, JobInputs,
    JobStatus, RunSummary, DEFAULT_MAX_BATCH_SIZE,
};
