//! Log store: append-only segmented job output.

mod file;
mod postgres;

pub use file::FileLogStore;
pub use postgres::PgLogStore;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use kiln_core::{JobId, LogSegment};
use std::ops::Range;

use crate::DbResult;

/// Durable byte storage for a job's log, split into named segments.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Mark the job's log as live so tails follow new appends.
    async fn begin(&self, job: JobId) -> DbResult<()>;

    /// Open the next segment of the job's log for writing.
    ///
    /// Only one writer may be open per job; a second call fails with
    /// [`crate::DbError::WriterBusy`] until the first writer is closed or
    /// dropped. A segment left open by a dropped writer is closed at its
    /// current length.
    async fn open_segment(&self, job: JobId, name: &str) -> DbResult<Box<dyn SegmentWriter>>;

    /// Bytes of one segment; `range` is relative to the segment start and is
    /// clamped to what has been written.
    async fn read(&self, job: JobId, name: &str, range: Range<u64>) -> DbResult<Bytes>;

    /// The job's segments ordered by start offset.
    async fn segments(&self, job: JobId) -> DbResult<Vec<LogSegment>>;

    /// Persisted bytes from job-wide offset `from`, then live appends until the
    /// job is finished.
    fn tail(&self, job: JobId, from: u64) -> BoxStream<'static, DbResult<Bytes>>;

    /// Close any dangling open segment and end live tails.
    async fn finish(&self, job: JobId) -> DbResult<()>;
}

/// Exclusive writer for one open segment.
#[async_trait]
pub trait SegmentWriter: Send {
    fn segment(&self) -> &LogSegment;

    /// Job-wide offset the next appended byte will land at.
    fn offset(&self) -> u64;

    /// Append bytes; durable in the store before returning.
    async fn append(&mut self, data: &[u8]) -> DbResult<()>;

    /// Seal the segment, returning it with its end offset set.
    async fn close(self: Box<Self>) -> DbResult<LogSegment>;
}
