//! Request Queue
//!
//! Serializes independently submitted backend calls so that at most one is in flight
//! system-wide, with a fixed minimum spacing between calls. A single worker task drains
//! a FIFO; each submitter awaits a per-item completion channel.

use crate::error::ApiError;
use crate::executor::ExecutionResult;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

/// Queue timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Minimum gap between the end of one call and the start of the next (milliseconds)
    pub min_spacing_ms: u64,
    /// How long finished items stay visible to `status()` (milliseconds)
    pub retention_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_spacing_ms: 2_000,
            retention_ms: 60_000,
        }
    }
}

/// Lets the queue tell completed items from failed ones.
pub trait QueueOutcome {
    fn is_failure(&self) -> bool;
}

impl QueueOutcome for ExecutionResult {
    fn is_failure(&self) -> bool {
        !self.is_success()
    }
}

impl<T, E> QueueOutcome for Result<T, E> {
    fn is_failure(&self) -> bool {
        self.is_err()
    }
}

/// Counts of items by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishedState {
    Completed,
    Failed,
}

struct FinishedItem {
    id: String,
    state: FinishedState,
    finished_at: Instant,
}

// Type-erased work: resolves to whether the item failed
type WorkFuture = BoxFuture<'static, bool>;

struct QueueEntry {
    id: String,
    work: Box<dyn FnOnce() -> WorkFuture + Send>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueEntry>,
    processing: Option<String>,
    finished: VecDeque<FinishedItem>,
    last_finished: Option<Instant>,
    shut_down: bool,
}

/// Single-worker FIFO request queue
pub struct RequestQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: QueueConfig,
}

impl RequestQueue {
    /// Create the queue and spawn its worker. Must be called inside a tokio runtime.
    pub fn start(config: QueueConfig) -> Arc<Self> {
        let queue = Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            worker: Mutex::new(None),
            config,
        });

        let worker_queue = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            worker_queue.worker_loop().await;
        });
        *queue.worker.lock() = Some(handle);

        info!(
            min_spacing_ms = queue.config.min_spacing_ms,
            retention_ms = queue.config.retention_ms,
            "Started request queue worker"
        );
        queue
    }

    /// Submit work and wait for its result.
    ///
    /// Resolves exactly when this item finishes. Fails with [`ApiError::Queue`] if the
    /// queue is shut down before the item runs, or if the item panics.
    pub async fn enqueue<T, F, Fut>(&self, id: impl Into<String>, work: F) -> Result<T, ApiError>
    where
        T: QueueOutcome + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let id = id.into();
        let (tx, rx) = oneshot::channel::<T>();

        let entry = QueueEntry {
            id: id.clone(),
            work: Box::new(move || {
                async move {
                    let output = work().await;
                    let failed = output.is_failure();
                    // Submitter may have gone away; the outcome still counts.
                    let _ = tx.send(output);
                    failed
                }
                .boxed()
            }),
        };

        {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(ApiError::Queue(format!(
                    "Queue is shut down, rejected item {}",
                    id
                )));
            }
            state.pending.push_back(entry);
            debug!(item_id = %id, pending = state.pending.len(), "Enqueued request");
        }
        self.notify.notify_one();

        rx.await.map_err(|_| {
            if self.state.lock().shut_down {
                ApiError::Queue(format!("Queue shut down before item {} ran", id))
            } else {
                ApiError::Queue(format!("Item {} failed without producing a result", id))
            }
        })
    }

    /// Counts by state, after purging finished items past retention.
    pub fn status(&self) -> QueueStatus {
        let mut state = self.state.lock();
        Self::purge_finished(&mut state, self.retention());

        let mut status = QueueStatus {
            pending: state.pending.len(),
            processing: usize::from(state.processing.is_some()),
            ..QueueStatus::default()
        };
        for item in &state.finished {
            match item.state {
                FinishedState::Completed => status.completed += 1,
                FinishedState::Failed => status.failed += 1,
            }
        }
        status
    }

    /// Stop the worker. Pending items are rejected; an in-flight item runs to completion.
    pub async fn shutdown(&self) {
        let rejected = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            std::mem::take(&mut state.pending)
        };
        let rejected_count = rejected.len();
        // Dropping the entries closes their completion channels.
        drop(rejected);
        self.notify.notify_one();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(rejected = rejected_count, "Stopped request queue worker");
    }

    fn retention(&self) -> Duration {
        Duration::from_millis(self.config.retention_ms)
    }

    fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.config.min_spacing_ms)
    }

    fn purge_finished(state: &mut QueueState, retention: Duration) {
        let now = Instant::now();
        while let Some(front) = state.finished.front() {
            if now.duration_since(front.finished_at) < retention {
                break;
            }
            state.finished.pop_front();
        }
    }

    // Pop the next entry, or None once shut down
    async fn next_entry(&self) -> Option<QueueEntry> {
        loop {
            {
                let mut state = self.state.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(entry) = state.pending.pop_front() {
                    return Some(entry);
                }
            }
            self.notify.notified().await;
        }
    }

    async fn worker_loop(&self) {
        debug!("Queue worker started");

        while let Some(entry) = self.next_entry().await {
            let wait = {
                let state = self.state.lock();
                state
                    .last_finished
                    .map(|last| self.min_spacing().saturating_sub(last.elapsed()))
                    .unwrap_or(Duration::ZERO)
            };
            if !wait.is_zero() {
                debug!(item_id = %entry.id, delay_ms = wait.as_millis() as u64, "Spacing requests");
                sleep(wait).await;
            }

            self.state.lock().processing = Some(entry.id.clone());
            debug!(item_id = %entry.id, "Processing request");

            let QueueEntry { id, work } = entry;
            // Run on its own task so a panic only fails this item.
            let failed = match tokio::spawn(work()).await {
                Ok(failed) => failed,
                Err(join_error) => {
                    error!(item_id = %id, error = %join_error, "Queue item panicked");
                    true
                }
            };

            let mut state = self.state.lock();
            let now = Instant::now();
            state.processing = None;
            state.last_finished = Some(now);
            state.finished.push_back(FinishedItem {
                id: id.clone(),
                state: if failed {
                    FinishedState::Failed
                } else {
                    FinishedState::Completed
                },
                finished_at: now,
            });
            Self::purge_finished(&mut state, self.retention());
            debug!(item_id = %id, failed, pending = state.pending.len(), "Finished request");
        }

        debug!("Queue worker stopped");
    }

    /// Ids of finished items still within retention, oldest first.
    pub fn recent_items(&self) -> Vec<String> {
        let mut state = self.state.lock();
        Self::purge_finished(&mut state, self.retention());
        state.finished.iter().map(|item| item.id.clone()).collect()
    }
}
