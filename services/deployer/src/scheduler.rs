//! Delayed background work.
//!
//! Tasks run on the tokio runtime, detached from whoever scheduled them.
//! Each runs exactly once; a failing task is logged and not retried.
//! `shutdown` fires everything still waiting so pending work (such as
//! container retirement) is not lost when the process stops.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use quark_id::TaskId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct TaskScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    tasks: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    flush: watch::Sender<bool>,
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drops the task's entry once it finishes, panics included.
struct Finished {
    inner: Arc<Inner>,
    id: TaskId,
}

impl Drop for Finished {
    fn drop(&mut self) {
        self.inner.tasks().remove(&self.id);
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (flush, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                flush,
            }),
        }
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F, E>(&self, delay: Duration, label: &'static str, task: F) -> TaskId
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let id = TaskId::new();
        let mut flush = self.inner.flush.subscribe();
        let finished = Finished {
            inner: Arc::clone(&self.inner),
            id,
        };

        // Held across spawn so the task cannot remove itself before it is
        // inserted.
        let mut tasks = self.inner.tasks();
        let handle = tokio::spawn(async move {
            let _finished = finished;
            // The flush sender lives in `Inner`, which `_finished` keeps
            // alive, so the wait only ends when a flush is requested.
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = async { flush.wait_for(|f| *f).await.is_ok() } => {
                    debug!(task_id = %id, label, "Running task early for shutdown");
                }
            }

            match task.await {
                Ok(()) => info!(task_id = %id, label, "Scheduled task completed"),
                Err(e) => warn!(task_id = %id, label, error = %e, "Scheduled task failed"),
            }
        });
        tasks.insert(id, handle);

        debug!(task_id = %id, label, delay_ms = delay.as_millis() as u64, "Task scheduled");
        id
    }

    /// Tasks scheduled and not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.tasks().len()
    }

    /// Fire every waiting task now and wait for all of them to finish.
    /// Tasks scheduled after this run immediately.
    pub async fn shutdown(&self) {
        self.inner.flush.send_replace(true);
        let handles: Vec<_> = self.inner.tasks().drain().collect();
        info!(count = handles.len(), "Flushing scheduled tasks");

        for (id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(task_id = %id, error = %e, "Scheduled task panicked");
            }
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}
