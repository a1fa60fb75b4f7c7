//! Task tracking for per-cluster background tasks
//!
//! Holds the join handles of upgrade error observers and the liveness ticker
//! so they can be aborted when a cluster is removed or the manager stops.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Tracks background tasks by key
pub struct TaskTracker {
    /// Map of key -> JoinHandle
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a task, aborting any previous task under the same key
    pub fn register(&self, key: impl Into<String>, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|_, task| !task.is_finished());
            if let Some(old_handle) = tasks.insert(key.into(), handle) {
                old_handle.abort();
            }
        }
    }

    /// Unregister and abort the task under `key`
    pub fn unregister(&self, key: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(key) {
                handle.abort();
            }
        }
    }

    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }

    /// Number of tracked tasks that are still running
    pub fn running(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.values().filter(|task| !task.is_finished()).count())
            .unwrap_or(0)
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
