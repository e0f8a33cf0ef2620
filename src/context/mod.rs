//! Context domain: project background text assembly, caching, and size validation.
//! The assembler owns fetching and concatenation; the cache owns freshness.

pub mod assembler;
pub mod cache;
pub mod fs_store;
pub mod store;

pub use assembler::{AssembleOptions, ContextAssembler};
pub use cache::{ContextCache, DEFAULT_CONTEXT_TTL};
pub use fs_store::FsDocumentStore;
pub use store::{DocumentStore, MemoryDocumentStore, ProjectMetadata, SourceDocument};

use crate::types::ProjectId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Assembled background text for one project.
///
/// Immutable once built. A refresh replaces the whole value; text blocks are shared
/// between the cached copy and every copy handed out.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectContext {
    pub project_id: ProjectId,
    pub metadata: ProjectMetadata,
    pub capability_text: Arc<str>,
    pub requirement_text: Arc<str>,
    pub token_estimate: usize,
    pub assembled_at: DateTime<Utc>,
    pub from_cache: bool,
}

impl ProjectContext {
    /// Render the context as a prompt preamble.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Project\n");
        out.push_str(&format!("Name: {}\n", self.metadata.name));
        if let Some(client) = &self.metadata.client {
            out.push_str(&format!("Client: {}\n", client));
        }
        if let Some(description) = &self.metadata.description {
            out.push_str(&format!("Description: {}\n", description));
        }
        for (key, value) in &self.metadata.attributes {
            out.push_str(&format!("{}: {}\n", key, value));
        }
        if !self.capability_text.is_empty() {
            out.push_str("\n# Capability documents\n");
            out.push_str(&self.capability_text);
            out.push('\n');
        }
        if !self.requirement_text.is_empty() {
            out.push_str("\n# Requirement documents\n");
            out.push_str(&self.requirement_text);
            out.push('\n');
        }
        out
    }

    /// Same payload, flagged as served from cache.
    pub(crate) fn as_cached(&self) -> Self {
        Self {
            from_cache: true,
            ..self.clone()
        }
    }
}

/// Result of checking a context against the token budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextValidation {
    pub valid: bool,
    pub token_estimate: usize,
    pub warning: Option<String>,
}
