//! Progress reporting and run abort for bulk generation.

use crate::types::JobId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Phase a progress event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    /// Run accepted, batches formed.
    Preparing,
    /// A batch is about to be submitted.
    Generating,
    /// A batch attempt finished and its per-job results were recorded.
    BatchCompleted,
    /// A batch overflowed the token ceiling and was bisected.
    Splitting,
    /// The backend rate-limited a batch; waiting before retrying it.
    RateLimitWait,
    /// Sleeping between batches.
    Waiting,
    /// The run stopped scheduling batches because it was aborted.
    Aborted,
    /// All batches processed.
    Completed,
}

/// Progress event handed to the caller-supplied callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    /// 1-based index of the original batch this event concerns (0 before the first batch).
    pub batch_index: usize,
    pub total_batches: usize,
    /// Jobs with a terminal outcome so far (succeeded or failed).
    pub completed: usize,
    pub total: usize,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub in_flight: Vec<JobId>,
}

/// Progress callback. Invoked synchronously; must not block.
pub type ProgressCallback<'a> = &'a (dyn Fn(&ProgressEvent) + Send + Sync);

/// Callback that discards every event.
pub fn ignore_progress(_event: &ProgressEvent) {}

/// Cooperative abort flag shared between a run and its caller.
///
/// Aborting never interrupts an in-flight backend call; it only stops further scheduling.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Cumulative rate-limit wait allowed across one run.
///
/// Clones share the same tally, so the executor's in-call waits and the orchestrator's
/// batch-level waits draw from one ceiling.
#[derive(Debug, Clone)]
pub struct RateLimitBudget {
    limit: Duration,
    spent: Arc<Mutex<Duration>>,
}

impl RateLimitBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            spent: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Reserve `wait` if it fits in what is left. Nothing is reserved on refusal.
    pub fn try_spend(&self, wait: Duration) -> bool {
        let mut spent = self.spent.lock();
        match spent.checked_add(wait) {
            Some(total) if total <= self.limit => {
                *spent = total;
                true
            }
            _ => false,
        }
    }

    pub fn spent(&self) -> Duration {
        *self.spent.lock()
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}
