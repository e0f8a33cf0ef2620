//! Scribe: Batched Document Generation
//!
//! Generates many documents for a project through a rate-limited language-model
//! backend. Jobs are grouped into token-bounded batches, oversized batches are
//! bisected, rate limits are waited out, and every job ends with a recorded outcome.

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod generation;
pub mod logging;
pub mod progress;
pub mod provider;
pub mod queue;
pub mod tokens;
pub mod types;

pub use config::{ConfigLoader, ScribeConfig};
pub use context::{ContextAssembler, ContextCache, DocumentStore, ProjectContext};
pub use error::ApiError;
pub use executor::{ExecutionRequest, ExecutionResult, RequestExecutor};
pub use generation::{BatchOrchestrator, GenerationJob, Persistence, RunSummary};
pub use progress::{AbortSignal, ProgressEvent, ProgressPhase, RateLimitBudget};
pub use provider::{BackendError, Completion, GenerationBackend};
pub use queue::RequestQueue;
pub use types::{JobId, ProjectId};
