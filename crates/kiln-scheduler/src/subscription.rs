//! Log subscriptions: replay from the stores, then follow the live hub.
//!
//! The hub channel is joined before anything is read back, so nothing is
//! missed between replay and live delivery. Anything seen twice is dropped
//! by offset (lines), by name (segment opens and closes) or by phase rank.

use futures::StreamExt;
use futures::stream::BoxStream;
use kiln_core::event::JobUpdate;
use kiln_core::{JobId, Result};
use kiln_db::DbError;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::service::Shared;

pub(crate) async fn subscribe(
    shared: Arc<Shared>,
    id: JobId,
    from: u64,
) -> Result<BoxStream<'static, JobUpdate>> {
    let live = shared.hub.subscribe(id);
    shared.job_store.get(id).await?;

    let (tx, rx) = mpsc::channel(shared.config.subscriber_buffer.max(1));
    let follower = Follower {
        shared,
        id,
        tx,
        pos: from,
        last_rank: None,
        opened: HashSet::new(),
        closed: HashSet::new(),
    };
    tokio::spawn(follower.run(live));
    Ok(ReceiverStream::new(rx).boxed())
}

/// Why delivery stopped.
enum Stop {
    /// The terminal phase was delivered.
    Ended,
    /// The subscriber went away.
    Gone,
}

struct Follower {
    shared: Arc<Shared>,
    id: JobId,
    tx: mpsc::Sender<JobUpdate>,
    /// Job-wide offset up to which log output has been delivered.
    pos: u64,
    last_rank: Option<u8>,
    opened: HashSet<String>,
    closed: HashSet<String>,
}

impl Follower {
    async fn run(mut self, live: Option<broadcast::Receiver<JobUpdate>>) {
        match self.replay().await {
            Ok(None) => {}
            Ok(Some(_)) => return,
            Err(e) => {
                warn!(job_id = %self.id, error = %e, "Log replay failed");
                return;
            }
        }

        // No pump in this process is publishing for the job.
        let Some(mut live) = live else {
            self.close().await;
            return;
        };
        loop {
            let stop = match live.recv().await {
                Ok(update) => self.deliver(update).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(job_id = %self.id, skipped, "Subscriber lagged, replaying from store");
                    match self.replay().await {
                        Ok(stop) => stop,
                        Err(e) => {
                            warn!(job_id = %self.id, error = %e, "Log replay failed");
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    match self.replay().await {
                        Ok(None) => self.close().await,
                        Ok(Some(_)) => {}
                        Err(e) => warn!(job_id = %self.id, error = %e, "Log replay failed"),
                    }
                    return;
                }
            };
            if stop.is_some() {
                return;
            }
        }
    }

    /// End a stream that has nothing live left to follow. The subscriber
    /// always gets a closing phase update: the terminal one if the job has
    /// finished by now, otherwise its current phase repeated.
    async fn close(&mut self) {
        let job = match self.shared.job_store.get(self.id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %self.id, error = %e, "Could not re-read job before closing");
                return;
            }
        };
        let update = JobUpdate::Phase {
            phase: job.phase,
            reason: job.reason,
            at: job.ended_at.or(job.started_at).unwrap_or(job.created_at),
        };
        if job.phase.is_terminal() {
            self.deliver(update).await;
        } else {
            debug!(job_id = %self.id, phase = %job.phase, "Closing subscription on a job nobody is running");
            self.send(update).await;
        }
    }

    async fn send(&self, update: JobUpdate) -> Option<Stop> {
        match self.tx.send(update).await {
            Ok(()) => None,
            Err(_) => Some(Stop::Gone),
        }
    }

    /// Filter one live update against what was already delivered.
    async fn deliver(&mut self, update: JobUpdate) -> Option<Stop> {
        match &update {
            JobUpdate::Phase { phase, .. } => {
                if self.last_rank.is_some_and(|rank| phase.rank() <= rank) {
                    return None;
                }
                self.last_rank = Some(phase.rank());
                let terminal = phase.is_terminal();
                if let Some(stop) = self.send(update).await {
                    return Some(stop);
                }
                return terminal.then_some(Stop::Ended);
            }
            JobUpdate::SegmentOpened { name, offset } => {
                if *offset < self.pos || !self.opened.insert(name.clone()) {
                    return None;
                }
            }
            JobUpdate::Line { offset, .. } => {
                if *offset < self.pos {
                    return None;
                }
            }
            JobUpdate::SegmentClosed { name, offset } => {
                if *offset < self.pos || !self.closed.insert(name.clone()) {
                    return None;
                }
            }
        }
        if let Some(end) = update.end_offset() {
            self.pos = self.pos.max(end);
        }
        self.send(update).await
    }

    /// Deliver everything the stores hold beyond what was already sent.
    async fn replay(&mut self) -> Result<Option<Stop>> {
        // The job is read first: once it is terminal its log is complete.
        let job = self.shared.job_store.get(self.id).await?;

        for transition in self.shared.job_store.transitions(self.id).await? {
            if transition.to.is_terminal() {
                continue;
            }
            let update = JobUpdate::Phase {
                phase: transition.to,
                reason: transition.reason,
                at: transition.at,
            };
            if let Some(stop) = self.deliver(update).await {
                return Ok(Some(stop));
            }
        }

        let segments = match self.shared.log_store.segments(self.id).await {
            Ok(segments) => segments,
            // Nothing was ever logged.
            Err(DbError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        for segment in segments {
            let start = segment.start_offset;
            if segment.end_offset.is_some_and(|end| end <= self.pos) && start < self.pos {
                continue;
            }

            let opened = JobUpdate::SegmentOpened {
                name: segment.name.clone(),
                offset: start,
            };
            if let Some(stop) = self.deliver(opened).await {
                return Ok(Some(stop));
            }

            let data = self
                .shared
                .log_store
                .read(self.id, &segment.name, 0..u64::MAX)
                .await?;
            let mut offset = start;
            let mut rest: &[u8] = &data;
            // Only complete lines; a partial tail arrives live.
            while let Some(newline) = rest.iter().position(|b| *b == b'\n') {
                let line = JobUpdate::Line {
                    segment: segment.name.clone(),
                    offset,
                    text: String::from_utf8_lossy(&rest[..newline]).into_owned(),
                };
                offset += newline as u64 + 1;
                rest = &rest[newline + 1..];
                if let Some(stop) = self.deliver(line).await {
                    return Ok(Some(stop));
                }
            }

            if let Some(end) = segment.end_offset {
                let closed = JobUpdate::SegmentClosed {
                    name: segment.name.clone(),
                    offset: end,
                };
                if let Some(stop) = self.deliver(closed).await {
                    return Ok(Some(stop));
                }
            }
        }

        if job.phase.is_terminal() {
            let update = JobUpdate::Phase {
                phase: job.phase,
                reason: job.reason,
                at: job.ended_at.unwrap_or(job.created_at),
            };
            return Ok(self.deliver(update).await);
        }
        Ok(None)
    }
}
