//! In-process registry of jobs whose logs are still being written.
//!
//! Both log store backends share this registry so tails can follow appends
//! without polling storage.

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use kiln_core::JobId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

use super::logs::LogStore;
use crate::{DbError, DbResult};

/// What a tail needs to know about a live job's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveState {
    /// Bytes persisted so far, job-wide.
    pub len: u64,
    pub finished: bool,
}

#[derive(Debug, Default)]
pub struct LiveLogs {
    jobs: Mutex<HashMap<JobId, watch::Sender<LiveState>>>,
    writers: Mutex<HashSet<JobId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LiveLogs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a job's log as live, starting at `len` persisted bytes.
    pub fn begin(&self, job: JobId, len: u64) {
        lock(&self.jobs).entry(job).or_insert_with(|| {
            let (tx, _) = watch::channel(LiveState {
                len,
                finished: false,
            });
            tx
        });
    }

    pub fn is_live(&self, job: JobId) -> bool {
        lock(&self.jobs).contains_key(&job)
    }

    pub fn subscribe(&self, job: JobId) -> Option<watch::Receiver<LiveState>> {
        lock(&self.jobs).get(&job).map(|tx| tx.subscribe())
    }

    /// Publish a new persisted length.
    pub fn advance(&self, job: JobId, len: u64) {
        if let Some(tx) = lock(&self.jobs).get(&job) {
            tx.send_modify(|state| state.len = state.len.max(len));
        }
    }

    /// End live tailing for a job. Tails drain what is persisted and stop.
    pub fn finish(&self, job: JobId) {
        if let Some(tx) = lock(&self.jobs).remove(&job) {
            tx.send_modify(|state| state.finished = true);
            debug!(job_id = %job, "Log finished");
        }
    }

    /// Take the single writer slot for a job.
    pub fn claim_writer(self: &Arc<Self>, job: JobId) -> DbResult<WriterClaim> {
        if !lock(&self.writers).insert(job) {
            return Err(DbError::WriterBusy(format!("job {}", job)));
        }
        Ok(WriterClaim {
            live: Arc::clone(self),
            job,
        })
    }
}

/// Held by an open segment writer; releases the job's writer slot on drop.
#[derive(Debug)]
pub struct WriterClaim {
    live: Arc<LiveLogs>,
    job: JobId,
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        lock(&self.live.writers).remove(&self.job);
    }
}

/// Read the persisted bytes starting at job-wide offset `from`, up to the end
/// of the segment that contains it.
pub(crate) async fn read_from<S>(store: &S, job: JobId, from: u64) -> DbResult<Bytes>
where
    S: LogStore + ?Sized,
{
    for segment in store.segments(job).await? {
        if segment.end_offset.is_some_and(|end| end <= from) {
            continue;
        }
        let relative = from.saturating_sub(segment.start_offset);
        let bytes = store.read(job, &segment.name, relative..u64::MAX).await?;
        if !bytes.is_empty() {
            return Ok(bytes);
        }
    }
    Ok(Bytes::new())
}

/// Replay persisted bytes from `from`, then follow live appends until the job
/// finishes.
pub(crate) fn follow<S>(
    store: S,
    live: &LiveLogs,
    job: JobId,
    from: u64,
) -> BoxStream<'static, DbResult<Bytes>>
where
    S: LogStore + Clone + 'static,
{
    let rx = live.subscribe(job);

    futures::stream::unfold(Some((store, rx, from)), move |state| async move {
        let (store, mut rx, mut pos) = state?;
        loop {
            let snapshot = rx.as_mut().map(|rx| *rx.borrow_and_update());

            let chunk = match read_from(&store, job, pos).await {
                Ok(chunk) => chunk,
                Err(e) => return Some((Err(e), None)),
            };
            if !chunk.is_empty() {
                pos += chunk.len() as u64;
                return Some((Ok(chunk), Some((store, rx, pos))));
            }

            match (snapshot, rx.as_mut()) {
                (Some(snapshot), Some(watcher)) if !snapshot.finished => {
                    if watcher.changed().await.is_err() {
                        // Sender gone: one last read, then end.
                        rx = None;
                    }
                }
                _ => return None,
            }
        }
    })
    .boxed()
}
