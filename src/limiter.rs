//! Bounded-concurrency admission control for pipeline runs.
//!
//! At most `limit` runs hold a permit at once. The limit is adjustable at
//! runtime: lowering it never evicts admitted runs, it only holds back new
//! admissions until enough permits drain. Waiters re-check the predicate
//! after every wake, so limit changes and releases can interleave freely.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Default number of concurrently admitted runs.
pub const DEFAULT_ADMISSION_LIMIT: usize = 4;

#[derive(Debug)]
struct LimiterState {
    limit: usize,
    running: usize,
}

/// Counting admission gate shared by all runs in a process.
#[derive(Debug)]
pub struct AdmissionLimiter {
    state: Mutex<LimiterState>,
    notify: Notify,
}

impl AdmissionLimiter {
    /// Create a limiter admitting at most `limit` runs (clamped to >= 1).
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LimiterState {
                limit: limit.max(1),
                running: 0,
            }),
            notify: Notify::new(),
        })
    }

    /// Wait until a slot is free, claim it, and return the release handle.
    ///
    /// The permit releases its slot on drop and wakes one waiter.
    pub async fn acquire(self: &Arc<Self>) -> AdmissionPermit {
        loop {
            // Register interest before checking, otherwise a release
            // between the check and the await is a lost wakeup.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("limiter state poisoned");
                if state.running < state.limit {
                    state.running += 1;
                    return AdmissionPermit {
                        limiter: Arc::clone(self),
                    };
                }
            }
            notified.await;
        }
    }

    /// Change the admission ceiling (clamped to >= 1), effective immediately
    /// for new admissions. Already-admitted runs are never evicted.
    pub fn set_limit(&self, limit: usize) {
        {
            let mut state = self.state.lock().expect("limiter state poisoned");
            state.limit = limit.max(1);
        }
        // Every waiter re-evaluates: raising the limit may free several
        // slots at once.
        self.notify.notify_waiters();
    }

    /// Current admission ceiling.
    pub fn limit(&self) -> usize {
        self.state.lock().expect("limiter state poisoned").limit
    }

    /// Number of currently admitted runs.
    pub fn running(&self) -> usize {
        self.state.lock().expect("limiter state poisoned").running
    }
}

/// RAII handle for one admitted run.
#[derive(Debug)]
pub struct AdmissionPermit {
    limiter: Arc<AdmissionLimiter>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        {
            let mut state = self
                .limiter
                .state
                .lock()
                .expect("limiter state poisoned");
            state.running = state.running.saturating_sub(1);
        }
        self.limiter.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::timeout;

    #[tokio::test]
    async fn test_acquire_within_limit_is_immediate() {
        let limiter = AdmissionLimiter::new(2);
        let _a = limiter.acquire().await;
        let _b = limiter.acquire().await;
        assert_eq!(limiter.running(), 2);
        assert_eq!(limiter.limit(), 2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_limit_until_release() {
        let limiter = AdmissionLimiter::new(1);
        let held = limiter.acquire().await;

        let blocked = timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(blocked.is_err(), "third permit should not be granted");

        drop(held);
        let granted = timeout(Duration::from_millis(500), limiter.acquire()).await;
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn test_never_exceeds_limit_under_contention() {
        let limiter = AdmissionLimiter::new(3);
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = Arc::clone(&limiter);
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.running(), 0);
    }

    #[tokio::test]
    async fn test_lowering_limit_keeps_admitted_blocks_new() {
        let limiter = AdmissionLimiter::new(2);
        let _a = limiter.acquire().await;
        let _b = limiter.acquire().await;

        limiter.set_limit(1);
        assert_eq!(limiter.running(), 2, "admitted runs are not evicted");

        let blocked = timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(blocked.is_err(), "no admission above the new ceiling");

        // One release brings running to 1 == limit, still full.
        drop(_a);
        let blocked = timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(blocked.is_err());

        drop(_b);
        let granted = timeout(Duration::from_millis(500), limiter.acquire()).await;
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn test_raising_limit_wakes_waiters() {
        let limiter = AdmissionLimiter::new(1);
        let _held = limiter.acquire().await;

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _permit = limiter.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        limiter.set_limit(2);
        timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter should be admitted after raise")
            .unwrap();
    }

    #[tokio::test]
    async fn test_limit_clamps_to_one() {
        let limiter = AdmissionLimiter::new(0);
        assert_eq!(limiter.limit(), 1);
        limiter.set_limit(0);
        assert_eq!(limiter.limit(), 1);
    }
}
