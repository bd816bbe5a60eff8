//! Job store: durable job records and their transition log.

mod file;
mod postgres;

pub use file::FileJobStore;
pub use postgres::PgJobStore;

use async_trait::async_trait;
use kiln_core::{Job, JobFilter, JobId, LogSegment, Phase, PhaseTransition};

use crate::DbResult;

/// Durable record of jobs and their phase history.
///
/// Every method returns only after the write is committed.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in the `Created` phase, returning the stored record.
    async fn create(&self, job: &Job) -> DbResult<Job>;

    /// Atomically move a job to `phase`, appending to its transition log.
    ///
    /// Returns [`crate::DbError::Conflict`] when the move is not forward along
    /// the phase order; nothing is written in that case.
    async fn update_status(&self, id: JobId, phase: Phase, reason: Option<&str>) -> DbResult<Job>;

    async fn get(&self, id: JobId) -> DbResult<Job>;

    /// Jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter) -> DbResult<Vec<Job>>;

    /// The job's transition log, oldest first.
    async fn transitions(&self, id: JobId) -> DbResult<Vec<PhaseTransition>>;

    /// Insert or update the job's reference to a log segment.
    async fn record_segment(&self, id: JobId, segment: &LogSegment) -> DbResult<()>;

    /// Flag the job's stored log as truncated.
    async fn mark_log_incomplete(&self, id: JobId) -> DbResult<()>;

    /// Check the store is reachable.
    async fn ping(&self) -> DbResult<()>;
}
