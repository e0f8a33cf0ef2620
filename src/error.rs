//! Error types for the scribe generation engine.
//!
//! Generation outcomes (rate limits, token overflow, transient backend failures) are
//! not errors here: the executor and orchestrator return tagged values for those.
//! `ApiError` covers collaborator and infrastructure failures.

use crate::types::{JobId, ProjectId};
use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),

    #[error("Document store error: {0}")]
    DocumentStore(String),

    #[error("Persistence failed for job {job_id}: {message}")]
    Persistence { job_id: JobId, message: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Backend not configured: {0}")]
    BackendNotConfigured(String),

    #[error("Request queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Serialization(err.to_string())
    }
}
