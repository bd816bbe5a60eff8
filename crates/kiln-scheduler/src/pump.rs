//! Drives one job from `Scheduled` to its terminal phase: follows the task,
//! cuts its output into segments, persists and publishes everything.

use futures::StreamExt;
use kiln_core::event::JobUpdate;
use kiln_core::executor::{ExecutionEvent, TaskHandle, TaskStatus};
use kiln_core::{CutSession, Error, JobId, LogSegment, Phase, Result, SegmentEvent};
use kiln_db::SegmentWriter;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, warn};

use crate::service::Shared;

/// First-wins abort request shared by the pump, the watchdog and the
/// service.
#[derive(Clone)]
pub(crate) struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Returns `false` if an abort was already requested.
    pub(crate) fn trigger(&self, reason: &str) -> bool {
        let first = self.reason.set(reason.to_string()).is_ok();
        if first {
            self.token.cancel();
        }
        first
    }

    pub(crate) fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// How the pump ended.
struct Outcome {
    phase: Phase,
    reason: Option<String>,
}

impl Outcome {
    fn new(phase: Phase, reason: impl Into<Option<String>>) -> Self {
        Self {
            phase,
            reason: reason.into(),
        }
    }
}

/// Per-run log cutting state.
struct Cut {
    session: CutSession,
    writer: Option<Box<dyn SegmentWriter>>,
    used: HashSet<String>,
}

impl Cut {
    /// Segment names are unique per job; repeats get `.2`, `.3`, ...
    fn unique_name(&mut self, name: &str) -> String {
        let mut candidate = name.to_string();
        let mut n = 2;
        while self.used.contains(&candidate) {
            candidate = format!("{}.{}", name, n);
            n += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

pub(crate) struct Pump {
    shared: Arc<Shared>,
    id: JobId,
    handle: TaskHandle,
    signal: AbortSignal,
    done: CancellationToken,
    running: bool,
}

impl Pump {
    pub(crate) fn new(
        shared: Arc<Shared>,
        id: JobId,
        handle: TaskHandle,
        signal: AbortSignal,
        done: CancellationToken,
    ) -> Self {
        Self {
            shared,
            id,
            handle,
            signal,
            done,
            running: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let outcome = self.drive().await;

        // Whoever removes the entry writes the terminal phase.
        if self.shared.active().remove(&self.id).is_none() {
            return;
        }
        self.shared
            .finalize(self.id, outcome.phase, outcome.reason.as_deref())
            .await;
        self.done.cancel();
    }

    fn aborted(&self) -> Outcome {
        Outcome::new(Phase::Aborted, self.signal.reason().map(str::to_string))
    }

    async fn stop_task(&self) {
        if let Err(e) = self.shared.executor.stop(&self.handle).await {
            warn!(job_id = %self.id, task = %self.handle.task_id, error = %e, "Failed to stop task");
        }
    }

    async fn drive(&mut self) -> Outcome {
        let executor = &self.shared.executor;
        let handle = &self.handle;
        let watched = self
            .shared
            .config
            .retry
            .run("watch task", || executor.watch(handle))
            .await;
        let mut events = match watched {
            Ok(events) => events,
            Err(e) => {
                self.stop_task().await;
                if self.signal.reason().is_some() {
                    return self.aborted();
                }
                return Outcome::new(Phase::Failed, format!("could not follow task: {}", e));
            }
        };

        let mut cut = Cut {
            session: self.shared.cutter.session(),
            writer: None,
            used: HashSet::new(),
        };
        let mut aborting = false;
        let mut drain_deadline = Instant::now();

        let outcome = loop {
            tokio::select! {
                biased;

                _ = self.signal.cancelled(), if !aborting => {
                    aborting = true;
                    debug!(job_id = %self.id, "Stopping task");
                    self.stop_task().await;
                    drain_deadline = Instant::now() + self.shared.config.cancel_grace / 2;
                }

                _ = tokio::time::sleep_until(drain_deadline), if aborting => {
                    warn!(job_id = %self.id, "Task did not report after stop");
                    break self.aborted();
                }

                event = events.next() => match event {
                    None if aborting => break self.aborted(),
                    None => break Outcome::new(Phase::Failed, "execution lost".to_string()),
                    Some(ExecutionEvent::Output(line)) => {
                        if let Err(e) = self.mark_running().await {
                            break self.running_failed(e).await;
                        }
                        if let Err(e) = self.write_line(&mut cut, &line.content).await {
                            break self.log_failure(e).await;
                        }
                    }
                    Some(ExecutionEvent::OutputLost { .. }) if aborting => {}
                    Some(ExecutionEvent::OutputLost { reason }) => {
                        warn!(job_id = %self.id, reason = %reason, "Task output lost, stopping task");
                        break self.incomplete(format!("output stream lost: {}", reason)).await;
                    }
                    Some(ExecutionEvent::Status(status)) => {
                        if let Some(outcome) = self.on_status(status, aborting).await {
                            break outcome;
                        }
                    }
                },
            }
        };

        if let Some(event) = cut.session.finish() {
            if let Err(e) = self.apply(&mut cut, event).await {
                if outcome.phase == Phase::Succeeded {
                    return self.log_failure(e).await;
                }
                warn!(job_id = %self.id, error = %e, "Failed to close log segment");
            }
        }
        outcome
    }

    async fn on_status(&mut self, status: TaskStatus, aborting: bool) -> Option<Outcome> {
        if aborting && status.is_terminal() {
            return Some(self.aborted());
        }
        match status {
            TaskStatus::Pending => None,
            TaskStatus::Active => match self.mark_running().await {
                Ok(()) => None,
                Err(e) => Some(self.running_failed(e).await),
            },
            // A task that finished on its own ran, even if it was never seen
            // running.
            TaskStatus::Succeeded => Some(match self.mark_running().await {
                Ok(()) => Outcome {
                    phase: Phase::Succeeded,
                    reason: None,
                },
                Err(e) => self.running_failed(e).await,
            }),
            TaskStatus::Failed {
                exit_code: Some(_),
                message,
            } => {
                if let Err(e) = self.mark_running().await {
                    warn!(job_id = %self.id, error = %e, "Failed to record running phase");
                }
                Some(Outcome::new(Phase::Failed, message))
            }
            // No exit code: the task never got to run.
            TaskStatus::Failed {
                exit_code: None,
                message,
            } => Some(Outcome::new(Phase::Failed, message)),
            TaskStatus::Unknown { reason } => Some(Outcome::new(Phase::Failed, reason)),
            TaskStatus::Cancelled => Some(Outcome::new(
                Phase::Aborted,
                "task was stopped outside the service".to_string(),
            )),
        }
    }

    async fn mark_running(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.shared
            .record_phase(self.id, Phase::Running, None)
            .await?;
        self.running = true;
        Ok(())
    }

    /// A job whose `Running` phase could not be stored must not keep running.
    async fn running_failed(&self, e: Error) -> Outcome {
        error!(job_id = %self.id, error = %e, "Failed to record running phase, stopping task");
        self.stop_task().await;
        if self.signal.reason().is_some() {
            return self.aborted();
        }
        Outcome::new(Phase::Failed, format!("could not record running phase: {}", e))
    }

    /// Stop the task after output could not be stored.
    async fn log_failure(&self, e: Error) -> Outcome {
        error!(job_id = %self.id, error = %e, "Log persistence failed, stopping task");
        self.incomplete(format!("log persistence failed: {}", e)).await
    }

    /// Stop the task, flag the log as incomplete and fail the job.
    async fn incomplete(&self, reason: String) -> Outcome {
        self.stop_task().await;
        let store = &self.shared.job_store;
        let id = self.id;
        let flagged = self
            .shared
            .with_job_lock(id, "flag incomplete log", || async move {
                store.mark_log_incomplete(id).await.map_err(Error::from)
            })
            .await;
        if let Err(e) = flagged {
            warn!(job_id = %self.id, error = %e, "Failed to flag incomplete log");
        }
        Outcome::new(Phase::Failed, reason)
    }

    async fn write_line(&self, cut: &mut Cut, text: &str) -> Result<()> {
        for event in cut.session.feed(text) {
            self.apply(cut, event).await?;
        }
        Ok(())
    }

    async fn apply(&self, cut: &mut Cut, event: SegmentEvent) -> Result<()> {
        match event {
            SegmentEvent::Open(name) => {
                let name = cut.unique_name(&name);
                let writer = self.shared.log_store.open_segment(self.id, &name).await?;
                let segment = writer.segment().clone();
                cut.writer = Some(writer);
                self.record_segment(&segment).await?;
                self.shared.hub.publish(
                    self.id,
                    JobUpdate::SegmentOpened {
                        name,
                        offset: segment.start_offset,
                    },
                );
            }
            SegmentEvent::Line(text) => {
                let Some(writer) = cut.writer.as_mut() else {
                    return Err(Error::Internal("line outside of a segment".to_string()));
                };
                let offset = writer.offset();
                let mut data = Vec::with_capacity(text.len() + 1);
                data.extend_from_slice(text.as_bytes());
                data.push(b'\n');
                writer.append(&data).await?;
                let segment = writer.segment().name.clone();
                self.shared.hub.publish(
                    self.id,
                    JobUpdate::Line {
                        segment,
                        offset,
                        text,
                    },
                );
            }
            SegmentEvent::Close => {
                let Some(writer) = cut.writer.take() else {
                    return Ok(());
                };
                let segment = writer.close().await?;
                self.record_segment(&segment).await?;
                self.shared.hub.publish(
                    self.id,
                    JobUpdate::SegmentClosed {
                        offset: segment.end_offset.unwrap_or(segment.start_offset),
                        name: segment.name,
                    },
                );
            }
        }
        Ok(())
    }

    async fn record_segment(&self, segment: &LogSegment) -> Result<()> {
        let store = &self.shared.job_store;
        let id = self.id;
        self.shared
            .with_job_lock(id, "record log segment", || async move {
                store.record_segment(id, segment).await.map_err(Error::from)
            })
            .await
    }
}
