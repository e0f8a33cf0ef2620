//! Context cache: one per process, constructed explicitly and shared by reference.

use super::ProjectContext;
use crate::types::ProjectId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default time-to-live for a cached context.
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    context: ProjectContext,
    stored_at: Instant,
}

/// TTL'd map of project contexts
pub struct ContextCache {
    entries: RwLock<HashMap<ProjectId, CacheEntry>>,
    ttl: Duration,
}

impl ContextCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh entry for `project_id`, flagged `from_cache`. Expired entries are dropped.
    pub fn get(&self, project_id: &ProjectId) -> Option<ProjectContext> {
        {
            let entries = self.entries.read();
            match entries.get(project_id) {
                Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                    return Some(entry.context.as_cached());
                }
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write();
        // Re-check under the write lock; another writer may have refreshed it.
        if let Some(entry) = entries.get(project_id) {
            if entry.stored_at.elapsed() < self.ttl {
                return Some(entry.context.as_cached());
            }
            debug!(project_id = %project_id, "Context cache entry expired");
            entries.remove(project_id);
        }
        None
    }

    /// Replace the entry for the context's project.
    pub fn insert(&self, context: ProjectContext) {
        let project_id = context.project_id.clone();
        self.entries.write().insert(
            project_id,
            CacheEntry {
                context,
                stored_at: Instant::now(),
            },
        );
    }

    /// Remove one project's entry, or every entry when `project_id` is `None`.
    pub fn invalidate(&self, project_id: Option<&ProjectId>) {
        let mut entries = self.entries.write();
        match project_id {
            Some(id) => {
                if entries.remove(id).is_some() {
                    debug!(project_id = %id, "Invalidated cached context");
                }
            }
            None => {
                let count = entries.len();
                entries.clear();
                debug!(count, "Invalidated all cached contexts");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_TTL)
    }
}
