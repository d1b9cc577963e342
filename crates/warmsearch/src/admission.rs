//! Concurrency gate for retrievals.
//!
//! Built on `tokio::sync::Semaphore`, which hands permits to waiters in arrival order.
//! Demand above the limit queues and is never rejected; the pipeline deadline is the only
//! bound on how long a caller waits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    waiting: AtomicUsize,
}

#[derive(Clone)]
pub struct AdmissionController {
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
    limit: usize,
}

/// One of the `limit` permits. Dropping it admits the oldest waiter.
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct WaitGuard<'a>(&'a Counters);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionController {
    /// A zero `limit` is raised to 1.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            counters: Arc::new(Counters::default()),
            limit,
        }
    }

    /// `None` once the controller is closed for shutdown.
    pub async fn acquire(&self) -> Option<AdmissionSlot> {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(tokio::sync::TryAcquireError::Closed) => return None,
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                self.counters.waiting.fetch_add(1, Ordering::SeqCst);
                let _waiting = WaitGuard(&self.counters);
                self.permits.clone().acquire_owned().await.ok()?
            }
        };
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        Some(AdmissionSlot {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    /// Wakes every queued caller with `None` and refuses new ones.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    pub fn waiting(&self) -> usize {
        self.counters.waiting.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
