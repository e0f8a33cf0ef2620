//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::ApiError;

/// Map domain/service errors to a string for CLI output.
pub fn map_error(e: &ApiError) -> String {
    match e {
        ApiError::ProjectNotFound(id) => format!(
            "Project not found: {} (expected <projects-dir>/{}/project.json)",
            id, id
        ),
        ApiError::BackendNotConfigured(msg) => format!(
            "Backend not configured: {}. Set [backend] in config/config.toml or SCRIBE__BACKEND__MODEL.",
            msg
        ),
        other => other.to_string(),
    }
}
