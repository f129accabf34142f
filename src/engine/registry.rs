//! Registry of in-flight runs for external cancellation.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::cancel::CancelHandle;

/// Concurrency-safe map run-id -> cancellation handle.
///
/// Owned by whoever drives runs (the CLI, an embedding service); there is no
/// process-global instance. Entries are registered at admission and removed
/// at termination, so `active_runs` reflects live work only.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, CancelHandle>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and get its cancellation handle.
    pub fn register(&self, run_id: &str) -> CancelHandle {
        let handle = CancelHandle::new();
        self.runs
            .lock()
            .expect("lock not poisoned")
            .insert(run_id.to_string(), handle.clone());
        handle
    }

    /// Signal a run to stop. Returns false for unknown ids.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.runs.lock().expect("lock not poisoned").get(run_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal every registered run to stop.
    pub fn cancel_all(&self) {
        for handle in self.runs.lock().expect("lock not poisoned").values() {
            handle.cancel();
        }
    }

    /// Drop a terminated run's entry.
    pub fn deregister(&self, run_id: &str) {
        self.runs.lock().expect("lock not poisoned").remove(run_id);
    }

    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .runs
            .lock()
            .expect("lock not poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.runs.lock().expect("lock not poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
