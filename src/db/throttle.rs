//! Bounds the number of storage operations in flight at once.

use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
};

use tokio::sync::Semaphore;

/// Admission gate in front of the database.
///
/// At most `limit` operations run concurrently; the rest wait in FIFO order
/// (tokio's semaphore is fair) and are admitted as soon as a permit is
/// released, whether the finished operation succeeded or failed.
pub struct DbThrottle {
    permits: Semaphore,
    limit: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl DbThrottle {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Semaphore::new(limit),
            limit,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Run `operation` once a slot is free and hand back its output untouched.
    pub async fn execute<F, Fut>(&self, operation: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        // The semaphore is never closed; `ok()` only matters if that changes.
        let _permit = self.permits.acquire().await.ok();

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _slot = InFlight(&self.in_flight);

        operation().await
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest concurrency observed since construction.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
