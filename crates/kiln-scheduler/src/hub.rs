//! Per-job broadcast channels and write locks.

use kiln_core::JobId;
use kiln_core::event::JobUpdate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One bounded broadcast channel per live job. Slow receivers lose the
/// oldest updates and see `Lagged`.
pub(crate) struct Hub {
    channels: Mutex<HashMap<JobId, broadcast::Sender<JobUpdate>>>,
    capacity: usize,
}

impl Hub {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn open(&self, job: JobId) {
        lock(&self.channels)
            .entry(job)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    pub(crate) fn subscribe(&self, job: JobId) -> Option<broadcast::Receiver<JobUpdate>> {
        lock(&self.channels).get(&job).map(|tx| tx.subscribe())
    }

    /// Publish without waiting; nobody listening is fine.
    pub(crate) fn publish(&self, job: JobId, update: JobUpdate) {
        if let Some(tx) = lock(&self.channels).get(&job) {
            let _ = tx.send(update);
        }
    }

    /// Drop the job's channel. Receivers drain what is buffered, then see
    /// `Closed`.
    pub(crate) fn close(&self, job: JobId) {
        lock(&self.channels).remove(&job);
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self, job: JobId) -> bool {
        lock(&self.channels).contains_key(&job)
    }
}

/// Serializes job store writes per job.
#[derive(Default)]
pub(crate) struct JobLocks {
    locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobLocks {
    pub(crate) async fn lock(&self, job: JobId) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = Arc::clone(lock(&self.locks).entry(job).or_default());
        mutex.lock_owned().await
    }

    pub(crate) fn forget(&self, job: JobId) {
        lock(&self.locks).remove(&job);
    }
}
