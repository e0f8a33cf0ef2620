//! File-backed document store.
//!
//! Layout: `<root>/<project_id>/project.json`
//!
//! ```json
//! {
//!   "project": { "name": "Bridge bid", "client": "County council" },
//!   "capabilities": [ { "name": "Profile", "text_path": "docs/profile.txt", "is_primary": true } ],
//!   "requirements": [ { "name": "RFP", "text": "Design a bridge..." } ]
//! }
//! ```
//!
//! `text_path` is relative to the project directory. A document whose text cannot be
//! read is reported with no extracted text rather than failing the fetch.

use super::store::{DocumentStore, ProjectMetadata, SourceDocument};
use crate::error::ApiError;
use crate::types::ProjectId;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

const MANIFEST_FILE: &str = "project.json";

#[derive(Debug, Deserialize)]
struct ProjectManifest {
    project: ProjectMetadata,
    #[serde(default)]
    capabilities: Vec<ManifestDocument>,
    #[serde(default)]
    requirements: Vec<ManifestDocument>,
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    name: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    is_primary: Option<bool>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    text_path: Option<PathBuf>,
}

pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, project_id: &ProjectId) -> Result<PathBuf, ApiError> {
        let id = project_id.as_str();
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(ApiError::DocumentStore(format!(
                "Invalid project id: {:?}",
                id
            )));
        }
        Ok(self.root.join(id))
    }

    fn load_manifest(&self, project_id: &ProjectId) -> Result<(PathBuf, ProjectManifest), ApiError> {
        let dir = self.project_dir(project_id)?;
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(ApiError::ProjectNotFound(project_id.clone()));
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            ApiError::DocumentStore(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let manifest = serde_json::from_str(&raw).map_err(|e| {
            ApiError::DocumentStore(format!("Invalid manifest {}: {}", path.display(), e))
        })?;
        Ok((dir, manifest))
    }

    fn resolve(dir: &Path, doc: ManifestDocument) -> SourceDocument {
        let extracted_text = match (doc.text, &doc.text_path) {
            (Some(text), _) => Some(text),
            (None, Some(rel)) => {
                let path = dir.join(rel);
                match std::fs::read_to_string(&path) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(
                            document = %doc.name,
                            path = %path.display(),
                            error = %e,
                            "Document text unavailable"
                        );
                        None
                    }
                }
            }
            (None, None) => None,
        };
        SourceDocument {
            name: doc.name,
            category: doc.category,
            is_primary: doc.is_primary,
            extracted_text,
        }
    }

    fn documents(
        &self,
        project_id: &ProjectId,
        select: fn(ProjectManifest) -> Vec<ManifestDocument>,
    ) -> Result<Vec<SourceDocument>, ApiError> {
        let (dir, manifest) = self.load_manifest(project_id)?;
        Ok(select(manifest)
            .into_iter()
            .map(|doc| Self::resolve(&dir, doc))
            .collect())
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn fetch_project(&self, project_id: &ProjectId) -> Result<ProjectMetadata, ApiError> {
        Ok(self.load_manifest(project_id)?.1.project)
    }

    async fn fetch_capability_docs(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<SourceDocument>, ApiError> {
        self.documents(project_id, |m| m.capabilities)
    }

    async fn fetch_requirement_docs(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<SourceDocument>, ApiError> {
        self.documents(project_id, |m| m.requirements)
    }
}
