//! File-backed job store: one JSON document per job.

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::{Job, JobFilter, JobId, LogSegment, Phase, PhaseTransition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::JobStore;
use crate::repo::write_atomically;
use crate::{DbError, DbResult};

/// What is stored on disk for each job.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobDocument {
    job: Job,
    transitions: Vec<PhaseTransition>,
}

/// Job store keeping `<root>/<job id>.json` files.
///
/// All documents are cached in memory; every mutation rewrites the job's
/// document (temp file, fsync, rename) before the cache is updated. Writes
/// to one job are serialized by that job's lock; different jobs write
/// concurrently.
pub struct FileJobStore {
    root: PathBuf,
    jobs: Mutex<HashMap<JobId, JobDocument>>,
    writes: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FileJobStore {
    /// Open (creating if needed) a store rooted at `root`, loading existing jobs.
    pub async fn open(root: impl Into<PathBuf>) -> DbResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut jobs = HashMap::new();
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<JobDocument>(&content) {
                Ok(doc) => {
                    jobs.insert(doc.job.id, doc);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable job document");
                }
            }
        }
        debug!(root = %root.display(), count = jobs.len(), "Opened file job store");

        Ok(Self {
            root,
            jobs: Mutex::new(jobs),
            writes: Mutex::new(HashMap::new()),
        })
    }

    fn document_path(&self, id: JobId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    async fn persist(&self, doc: &JobDocument) -> DbResult<()> {
        let path = self.document_path(doc.job.id);
        write_atomically(&path, &serde_json::to_vec_pretty(doc)?).await
    }

    async fn write_lock(&self, id: JobId) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = Arc::clone(lock(&self.writes).entry(id).or_default());
        mutex.lock_owned().await
    }

    fn cached(&self, id: JobId) -> DbResult<JobDocument> {
        lock(&self.jobs)
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    /// Apply `mutate` to a copy of the job's document, persist it, then
    /// publish it to the cache.
    async fn modify<T>(
        &self,
        id: JobId,
        mutate: impl FnOnce(&mut JobDocument) -> DbResult<T>,
    ) -> DbResult<T> {
        let _write = self.write_lock(id).await;
        let mut updated = self.cached(id)?;
        let result = mutate(&mut updated)?;
        self.persist(&updated).await?;
        lock(&self.jobs).insert(id, updated);
        Ok(result)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: &Job) -> DbResult<Job> {
        let _write = self.write_lock(job.id).await;
        if lock(&self.jobs).contains_key(&job.id) {
            return Err(DbError::Duplicate(format!("job {}", job.id)));
        }
        let doc = JobDocument {
            job: job.clone(),
            transitions: vec![PhaseTransition {
                seq: 0,
                from: None,
                to: job.phase,
                reason: None,
                at: job.created_at,
            }],
        };
        self.persist(&doc).await?;
        lock(&self.jobs).insert(job.id, doc);
        Ok(job.clone())
    }

    async fn update_status(&self, id: JobId, phase: Phase, reason: Option<&str>) -> DbResult<Job> {
        self.modify(id, |doc| {
            let from = doc.job.phase;
            let at = Utc::now();
            doc.job
                .transition(phase, reason.map(str::to_string), at)
                .map_err(|e| DbError::Conflict(e.to_string()))?;
            doc.transitions.push(PhaseTransition {
                seq: doc.transitions.len() as u32,
                from: Some(from),
                to: phase,
                reason: reason.map(str::to_string),
                at,
            });
            Ok(doc.job.clone())
        })
        .await
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        lock(&self.jobs)
            .get(&id)
            .map(|doc| doc.job.clone())
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list(&self, filter: &JobFilter) -> DbResult<Vec<Job>> {
        let mut matching: Vec<Job> = lock(&self.jobs)
            .values()
            .filter(|doc| filter.matches(&doc.job))
            .map(|doc| doc.job.clone())
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn transitions(&self, id: JobId) -> DbResult<Vec<PhaseTransition>> {
        lock(&self.jobs)
            .get(&id)
            .map(|doc| doc.transitions.clone())
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn record_segment(&self, id: JobId, segment: &LogSegment) -> DbResult<()> {
        self.modify(id, |doc| {
            doc.job.upsert_segment(segment.clone());
            Ok(())
        })
        .await
    }

    async fn mark_log_incomplete(&self, id: JobId) -> DbResult<()> {
        self.modify(id, |doc| {
            doc.job.log_incomplete = true;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> DbResult<()> {
        tokio::fs::metadata(&self.root).await?;
        Ok(())
    }
}
