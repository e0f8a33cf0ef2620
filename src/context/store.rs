//! Document Store collaborator contract.
//!
//! The engine only reads extracted text and display metadata; uploading, extraction,
//! and CRUD live behind this trait.

use crate::error::ApiError;
use crate::types::ProjectId;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Project metadata included in every context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub name: String,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Free-form key/value pairs (deadline, sector, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ProjectMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: None,
            description: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// One source document as the store reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub is_primary: Option<bool>,
    /// `None` when text extraction failed or has not run.
    #[serde(default)]
    pub extracted_text: Option<String>,
}

impl SourceDocument {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
            is_primary: None,
            extracted_text: Some(text.into()),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = Some(true);
        self
    }

    /// Text, if extraction produced any non-blank content.
    pub fn usable_text(&self) -> Option<&str> {
        self.extracted_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }

    /// `=== name [category] (primary) ===`
    pub fn header(&self) -> String {
        let mut header = format!("=== {}", self.name);
        if let Some(category) = &self.category {
            header.push_str(&format!(" [{}]", category));
        }
        if self.is_primary == Some(true) {
            header.push_str(" (primary)");
        }
        header.push_str(" ===");
        header
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch_project(&self, project_id: &ProjectId) -> Result<ProjectMetadata, ApiError>;

    async fn fetch_capability_docs(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<SourceDocument>, ApiError>;

    async fn fetch_requirement_docs(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<SourceDocument>, ApiError>;
}

#[derive(Debug, Clone)]
struct StoredProject {
    metadata: ProjectMetadata,
    capabilities: Vec<SourceDocument>,
    requirements: Vec<SourceDocument>,
}

/// In-memory store. Counts project fetches so callers can observe cache behaviour.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    projects: RwLock<HashMap<ProjectId, StoredProject>>,
    fetches: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(
        &self,
        project_id: ProjectId,
        metadata: ProjectMetadata,
        capabilities: Vec<SourceDocument>,
        requirements: Vec<SourceDocument>,
    ) {
        self.projects.write().insert(
            project_id,
            StoredProject {
                metadata,
                capabilities,
                requirements,
            },
        );
    }

    /// Append a capability document. Callers must invalidate any cached context.
    pub fn add_capability_doc(&self, project_id: &ProjectId, doc: SourceDocument) -> Result<(), ApiError> {
        let mut projects = self.projects.write();
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| ApiError::ProjectNotFound(project_id.clone()))?;
        project.capabilities.push(doc);
        Ok(())
    }

    /// Number of `fetch_project` calls served.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn project(&self, project_id: &ProjectId) -> Result<StoredProject, ApiError> {
        self.projects
            .read()
            .get(project_id)
            .cloned()
            .ok_or_else(|| ApiError::ProjectNotFound(project_id.clone()))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn fetch_project(&self, project_id: &ProjectId) -> Result<ProjectMetadata, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.project(project_id)?.metadata)
    }

    async fn fetch_capability_docs(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<SourceDocument>, ApiError> {
        Ok(self.project(project_id)?.capabilities)
    }

    async fn fetch_requirement_docs(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<SourceDocument>, ApiError> {
        Ok(self.project(project_id)?.requirements)
    }
}
