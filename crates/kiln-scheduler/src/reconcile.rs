//! Startup reconciliation between the job store and the executor.

use kiln_core::executor::TaskHandle;
use kiln_core::{Error, JobFilter, JobId, Phase, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::service::Shared;

/// What reconciliation did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Non-terminal jobs whose task was still alive; the task was stopped.
    pub interrupted: Vec<JobId>,
    /// Non-terminal jobs with no task left.
    pub lost: Vec<JobId>,
    /// Tasks that belonged to no unfinished job and were stopped.
    pub orphans_stopped: Vec<TaskHandle>,
}

impl ReconcileReport {
    /// Number of jobs moved to a terminal phase.
    pub fn resolved(&self) -> usize {
        self.interrupted.len() + self.lost.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved() == 0 && self.orphans_stopped.is_empty()
    }
}

pub(crate) async fn run(shared: &Arc<Shared>) -> Result<ReconcileReport> {
    let executor = &shared.executor;
    let tasks = shared
        .config
        .retry
        .run("list tasks", || executor.reconcile())
        .await?;
    let store = &shared.job_store;
    let filter = JobFilter::in_phases([Phase::Created, Phase::Scheduled, Phase::Running]);
    let filter = &filter;
    let jobs = shared
        .config
        .retry
        .run("list unfinished jobs", || async move {
            store.list(filter).await.map_err(Error::from)
        })
        .await?;

    let unfinished: HashSet<JobId> = jobs.iter().map(|job| job.id).collect();
    let mut by_job: HashMap<JobId, Vec<TaskHandle>> = HashMap::new();
    let mut report = ReconcileReport::default();

    for task in tasks {
        // Jobs submitted by this process are left alone.
        if shared.active().contains_key(&task.job_id) {
            continue;
        }
        if unfinished.contains(&task.job_id) {
            by_job.entry(task.job_id).or_default().push(task);
            continue;
        }
        info!(job_id = %task.job_id, task = %task.task_id, "Stopping orphaned task");
        match executor.stop(&task).await {
            Ok(()) => report.orphans_stopped.push(task),
            Err(e) => warn!(task = %task.task_id, error = %e, "Failed to stop orphaned task"),
        }
    }

    for job in jobs {
        if shared.active().contains_key(&job.id) {
            continue;
        }
        let reason = match by_job.remove(&job.id) {
            Some(tasks) => {
                for task in &tasks {
                    if let Err(e) = executor.stop(task).await {
                        warn!(job_id = %job.id, task = %task.task_id, error = %e, "Failed to stop task");
                    }
                }
                report.interrupted.push(job.id);
                "interrupted by service restart"
            }
            None => {
                report.lost.push(job.id);
                "execution lost"
            }
        };
        warn!(job_id = %job.id, phase = %job.phase, reason, "Resolving unfinished job");
        shared.finalize(job.id, Phase::Failed, Some(reason)).await;
    }

    Ok(report)
}
