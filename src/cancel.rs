//! Cooperative stop signal for a single run.
//!
//! A handle is cheap to clone and safe to trip from any thread. Observers
//! either poll [`CancelHandle::is_cancelled`] at loop boundaries or await
//! [`CancelHandle::cancelled`] inside a select.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CancelInner {
    stopped: AtomicBool,
    notify: Notify,
}

/// Shared stop flag for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the run to stop. Idempotent.
    pub fn cancel(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolve once the handle is cancelled. Returns immediately if it
    /// already is.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
