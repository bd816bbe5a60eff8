//! The orchestration service.

use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use kiln_core::event::JobUpdate;
use kiln_core::executor::{Executor, TaskHandle, TaskSpec};
use kiln_core::{
    Cutter, Error, Job, JobFilter, JobId, JobSpec, Phase, PhaseTransition, Result, RetryPolicy,
};
use kiln_db::{JobStore, LogStore};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hub::{Hub, JobLocks};
use crate::pump::{AbortSignal, Pump};
use crate::reconcile::{self, ReconcileReport};
use crate::subscription;

/// Runtime settings for the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Default limit on a job's run time when its spec sets none.
    pub max_duration: Duration,
    /// How long a cancelled job may take to wind down before it is forced.
    pub cancel_grace: Duration,
    /// Per-subscriber queue length.
    pub subscriber_buffer: usize,
    /// Per-job broadcast buffer length.
    pub broadcast_capacity: usize,
    /// Backoff for transient job store and executor errors.
    pub retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(3600),
            cancel_grace: Duration::from_secs(30),
            subscriber_buffer: 256,
            broadcast_capacity: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// Bookkeeping for a job with a live task.
pub(crate) struct ActiveJob {
    pub(crate) handle: TaskHandle,
    pub(crate) signal: AbortSignal,
    /// Cancelled once the job has reached its terminal phase.
    pub(crate) done: CancellationToken,
    pub(crate) pump: Option<JoinHandle<()>>,
}

/// State shared by the service handle, pumps, watchdogs and subscriptions.
pub(crate) struct Shared {
    pub(crate) job_store: Arc<dyn JobStore>,
    pub(crate) log_store: Arc<dyn LogStore>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) cutter: Cutter,
    pub(crate) config: ServiceConfig,
    pub(crate) hub: Hub,
    pub(crate) locks: JobLocks,
    pub(crate) active: Mutex<HashMap<JobId, ActiveJob>>,
    pub(crate) closing: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub(crate) fn active(&self) -> MutexGuard<'_, HashMap<JobId, ActiveJob>> {
        lock(&self.active)
    }

    /// Write a phase change and publish it. Holds the job's write lock.
    pub(crate) async fn record_phase(
        &self,
        id: JobId,
        phase: Phase,
        reason: Option<&str>,
    ) -> Result<Job> {
        let _guard = self.locks.lock(id).await;
        let store = &self.job_store;
        let job = self
            .config
            .retry
            .run("update job status", || async move {
                store
                    .update_status(id, phase, reason)
                    .await
                    .map_err(Error::from)
            })
            .await?;

        let at = match phase {
            Phase::Running => job.started_at,
            p if p.is_terminal() => job.ended_at,
            _ => None,
        }
        .unwrap_or_else(Utc::now);
        self.hub.publish(
            id,
            JobUpdate::Phase {
                phase,
                reason: reason.map(str::to_string),
                at,
            },
        );
        Ok(job)
    }

    /// Run a job store write under the job's write lock.
    pub(crate) async fn with_job_lock<T, F, Fut>(&self, id: JobId, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _guard = self.locks.lock(id).await;
        self.config.retry.run(what, op).await
    }

    /// Record the terminal phase of a job and release everything it held.
    ///
    /// The caller must already have removed the job from the active map.
    /// A `Conflict` means someone else already ended the job; the stored
    /// terminal phase is republished so subscribers still see it.
    pub(crate) async fn finalize(&self, id: JobId, phase: Phase, reason: Option<&str>) {
        if let Err(e) = self.log_store.finish(id).await {
            warn!(job_id = %id, error = %e, "Failed to finish job log");
        }

        match self.record_phase(id, phase, reason).await {
            Ok(_) => match phase {
                Phase::Succeeded => info!(job_id = %id, "Job succeeded"),
                Phase::Aborted => info!(job_id = %id, reason = ?reason, "Job aborted"),
                _ => error!(job_id = %id, reason = ?reason, "Job failed"),
            },
            Err(Error::Conflict(_)) => {
                if let Ok(job) = self.job_store.get(id).await {
                    if job.phase.is_terminal() {
                        self.hub.publish(
                            id,
                            JobUpdate::Phase {
                                phase: job.phase,
                                reason: job.reason.clone(),
                                at: job.ended_at.unwrap_or_else(Utc::now),
                            },
                        );
                    }
                }
            }
            Err(e) => {
                error!(job_id = %id, phase = %phase, error = %e, "Failed to record terminal phase");
            }
        }

        self.hub.close(id);
        self.locks.forget(id);
    }

    /// Signal a job's pump to abort and start its escalation watchdog.
    ///
    /// Returns `None` if the job has no live task or is already aborting.
    pub(crate) fn abort_job(self: &Arc<Self>, id: JobId, reason: &str) -> Option<JoinHandle<()>> {
        let (signal, done) = {
            let active = self.active();
            let entry = active.get(&id)?;
            (entry.signal.clone(), entry.done.clone())
        };
        if !signal.trigger(reason) {
            return None;
        }
        info!(job_id = %id, reason = %reason, "Aborting job");

        let shared = Arc::clone(self);
        let reason = reason.to_string();
        Some(tokio::spawn(async move {
            shared.watchdog(id, done, reason).await;
        }))
    }

    /// Force a job to `Aborted` if its pump has not finished within the
    /// grace period.
    async fn watchdog(self: Arc<Self>, id: JobId, done: CancellationToken, reason: String) {
        if tokio::time::timeout(self.config.cancel_grace, done.cancelled())
            .await
            .is_ok()
        {
            return;
        }

        let entry = self.active().remove(&id);
        let Some(entry) = entry else {
            // The pump is already writing its terminal phase.
            done.cancelled().await;
            return;
        };

        warn!(job_id = %id, "Pump did not finish within grace period, forcing abort");
        if let Some(pump) = entry.pump {
            pump.abort();
            let _ = pump.await;
        }
        if let Err(e) = self.executor.stop(&entry.handle).await {
            warn!(job_id = %id, error = %e, "Failed to stop task");
        }
        self.finalize(id, Phase::Aborted, Some(&reason)).await;
        entry.done.cancel();
    }

    /// Abort the job when its run time runs out.
    fn spawn_deadline(self: &Arc<Self>, id: JobId, limit: Duration, done: CancellationToken) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    let reason = format!("exceeded maximum duration of {}s", limit.as_secs());
                    shared.abort_job(id, &reason);
                }
                _ = done.cancelled() => {}
            }
        });
    }
}

/// Accepts jobs, runs them and reports on them.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Service {
    shared: Arc<Shared>,
}

impl Service {
    /// Build a service without touching any backend.
    pub fn new(
        config: ServiceConfig,
        job_store: Arc<dyn JobStore>,
        log_store: Arc<dyn LogStore>,
        executor: Arc<dyn Executor>,
        cutter: Cutter,
    ) -> Self {
        let hub = Hub::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(Shared {
                job_store,
                log_store,
                executor,
                cutter,
                config,
                hub,
                locks: JobLocks::default(),
                active: Mutex::new(HashMap::new()),
                closing: CancellationToken::new(),
            }),
        }
    }

    /// Build the service, check the job store is reachable and reconcile
    /// with the executor.
    pub async fn start(
        config: ServiceConfig,
        job_store: Arc<dyn JobStore>,
        log_store: Arc<dyn LogStore>,
        executor: Arc<dyn Executor>,
        cutter: Cutter,
    ) -> Result<(Self, ReconcileReport)> {
        let service = Self::new(config, job_store, log_store, executor, cutter);
        service.shared.job_store.ping().await?;
        let report = service.reconcile().await?;
        info!(
            executor = service.shared.executor.name(),
            interrupted = report.interrupted.len(),
            lost = report.lost.len(),
            orphans = report.orphans_stopped.len(),
            "Service started"
        );
        Ok((service, report))
    }

    /// Resolve jobs and tasks left behind by a previous run.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        reconcile::run(&self.shared).await
    }

    /// Submit a job. Returns once the job is `Scheduled` (or recorded as
    /// `Failed` if the executor rejected it).
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        if self.shared.closing.is_cancelled() {
            return Err(Error::Internal("service is shutting down".to_string()));
        }
        spec.validate()?;

        let shared = &self.shared;
        let job = Job::new(spec);
        let id = job.id;
        let limit = job
            .pipeline
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(shared.config.max_duration);

        shared.hub.open(id);
        let store = &shared.job_store;
        let job_ref = &job;
        if let Err(e) = shared
            .config
            .retry
            .run("create job", || async move {
                store.create(job_ref).await.map_err(Error::from)
            })
            .await
        {
            shared.hub.close(id);
            return Err(e);
        }
        info!(job_id = %id, name = %job.name, "Job created");

        if let Err(e) = shared.log_store.begin(id).await {
            let reason = format!("log store unavailable: {}", e);
            shared.finalize(id, Phase::Failed, Some(&reason)).await;
            return Err(e.into());
        }

        let task = TaskSpec {
            job_id: id,
            job_name: job.name.clone(),
            pipeline: job.pipeline.clone(),
        };
        let handle = match shared.executor.start(task).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Task submission failed");
                let reason = e.to_string();
                shared.finalize(id, Phase::Failed, Some(&reason)).await;
                if matches!(e, Error::Submission(_)) {
                    return Err(e);
                }
                return Err(Error::Submission(reason));
            }
        };

        let signal = AbortSignal::new();
        let done = CancellationToken::new();
        shared.active().insert(
            id,
            ActiveJob {
                handle: handle.clone(),
                signal: signal.clone(),
                done: done.clone(),
                pump: None,
            },
        );

        if let Err(e) = shared.record_phase(id, Phase::Scheduled, None).await {
            error!(job_id = %id, error = %e, "Failed to record scheduled phase");
            shared.active().remove(&id);
            if let Err(e) = shared.executor.stop(&handle).await {
                warn!(job_id = %id, error = %e, "Failed to stop task");
            }
            let reason = format!("job store unavailable: {}", e);
            shared.finalize(id, Phase::Failed, Some(&reason)).await;
            return Err(e);
        }
        debug!(job_id = %id, task = %handle.task_id, "Job scheduled");

        let pump = Pump::new(Arc::clone(shared), id, handle, signal, done.clone());
        let task = tokio::spawn(pump.run());
        {
            let mut active = shared.active();
            match active.get_mut(&id) {
                Some(entry) => entry.pump = Some(task),
                // Force-aborted before the pump started.
                None => task.abort(),
            }
        }
        shared.spawn_deadline(id, limit, done);

        Ok(id)
    }

    /// Request cancellation of a job.
    ///
    /// Cancelling a job that already ended is a no-op.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        if self.shared.abort_job(id, "cancelled by user").is_some() {
            return Ok(());
        }
        let job = self.get_status(id).await?;
        if !job.phase.is_terminal() && !self.shared.active().contains_key(&id) {
            return Err(Error::Conflict(format!(
                "job {} is {} but has no live task",
                id, job.phase
            )));
        }
        Ok(())
    }

    pub async fn get_status(&self, id: JobId) -> Result<Job> {
        Ok(self.shared.job_store.get(id).await?)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self.shared.job_store.list(filter).await?)
    }

    pub async fn transitions(&self, id: JobId) -> Result<Vec<PhaseTransition>> {
        Ok(self.shared.job_store.transitions(id).await?)
    }

    /// Bytes of one log segment; `range` is relative to the segment start.
    pub async fn read_segment(&self, id: JobId, name: &str, range: Range<u64>) -> Result<Bytes> {
        Ok(self.shared.log_store.read(id, name, range).await?)
    }

    /// Follow a job from job-wide log offset `from`: replayed history first,
    /// then live updates. The stream ends after the terminal phase.
    pub async fn subscribe_logs(
        &self,
        id: JobId,
        from: u64,
    ) -> Result<BoxStream<'static, JobUpdate>> {
        subscription::subscribe(Arc::clone(&self.shared), id, from).await
    }

    /// Check the job store is reachable.
    pub async fn ping(&self) -> Result<()> {
        Ok(self.shared.job_store.ping().await?)
    }

    /// Number of jobs with a live task.
    pub fn active_jobs(&self) -> usize {
        self.shared.active().len()
    }

    pub fn executor_name(&self) -> &'static str {
        self.shared.executor.name()
    }

    /// Stop accepting jobs and abort every running one.
    pub async fn shutdown(&self) {
        self.shared.closing.cancel();
        let ids: Vec<JobId> = self.shared.active().keys().copied().collect();
        info!(count = ids.len(), "Shutting down, aborting running jobs");

        let watchdogs: Vec<JoinHandle<()>> = ids
            .into_iter()
            .filter_map(|id| self.shared.abort_job(id, "service shutdown"))
            .collect();
        futures::future::join_all(watchdogs).await;

        // Jobs already aborting before shutdown have their own watchdogs.
        let pending: Vec<CancellationToken> = self
            .shared
            .active()
            .values()
            .map(|entry| entry.done.clone())
            .collect();
        for done in pending {
            let _ = tokio::time::timeout(self.shared.config.cancel_grace, done.cancelled()).await;
        }
        info!("Shutdown complete");
    }
}
