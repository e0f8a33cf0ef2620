//! Persistence collaborator: where generated documents go.
//!
//! `upsert` creates or replaces the stored result for a job. A failure affects that one
//! job only.

use super::plan::GeneratedDocument;
use crate::error::ApiError;
use crate::types::JobId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn upsert(&self, job_id: &JobId, document: &GeneratedDocument) -> Result<(), ApiError>;
}

/// Writes each document to `<dir>/<job_id>.json`.
///
/// Bytes of the id outside `[A-Za-z0-9_-]` are written as `%XX`, so distinct ids never
/// share a file and no id escapes `dir`.
pub struct JsonDirPersistence {
    dir: PathBuf,
}

impl JsonDirPersistence {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ApiError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(job_id)))
    }
}

fn file_stem(job_id: &JobId) -> String {
    let mut stem = String::with_capacity(job_id.as_str().len());
    for byte in job_id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

#[async_trait]
impl Persistence for JsonDirPersistence {
    async fn upsert(&self, job_id: &JobId, document: &GeneratedDocument) -> Result<(), ApiError> {
        let path = self.path_for(job_id);
        let persistence_error = |message: String| ApiError::Persistence {
            job_id: job_id.clone(),
            message,
        };

        let json = serde_json::to_vec_pretty(document).map_err(|e| persistence_error(e.to_string()))?;
        // Write then rename so a reader never sees a half-written file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| persistence_error(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| persistence_error(format!("rename to {}: {}", path.display(), e)))?;

        debug!(job_id = %job_id, path = %path.display(), "Persisted generated document");
        Ok(())
    }
}

/// In-memory sink keyed by job id.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    documents: RwLock<HashMap<JobId, GeneratedDocument>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &JobId) -> Option<GeneratedDocument> {
        self.documents.read().get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn upsert(&self, job_id: &JobId, document: &GeneratedDocument) -> Result<(), ApiError> {
        self.documents.write().insert(job_id.clone(), document.clone());
        Ok(())
    }
}
