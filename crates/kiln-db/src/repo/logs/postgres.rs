//! PostgreSQL-backed log store. Segment bytes are appended in place to a
//! `bytea` column.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use kiln_core::{JobId, LogSegment};
use sqlx::PgPool;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{LogStore, SegmentWriter};
use crate::repo::live::{LiveLogs, WriterClaim, follow};
use crate::{DbError, DbResult};

#[derive(Clone)]
pub struct PgLogStore {
    pool: PgPool,
    live: Arc<LiveLogs>,
}

#[derive(Debug, sqlx::FromRow)]
struct SegmentRow {
    name: String,
    start_offset: i64,
    end_offset: Option<i64>,
}

impl From<SegmentRow> for LogSegment {
    fn from(row: SegmentRow) -> Self {
        LogSegment {
            name: row.name,
            start_offset: row.start_offset as u64,
            end_offset: row.end_offset.map(|o| o as u64),
        }
    }
}

impl PgLogStore {
    pub fn new(pool: PgPool, live: Arc<LiveLogs>) -> Self {
        Self { pool, live }
    }

    async fn close_dangling<'e, E>(executor: E, job: JobId) -> DbResult<u64>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE log_segments
            SET end_offset = start_offset + octet_length(content)
            WHERE job_id = $1 AND end_offset IS NULL
            "#,
        )
        .bind(job.as_uuid())
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn begin(&self, job: JobId) -> DbResult<()> {
        let (len,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(COALESCE(end_offset, start_offset + octet_length(content))), 0)::BIGINT
            FROM log_segments
            WHERE job_id = $1
            "#,
        )
        .bind(job.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        self.live.begin(job, len as u64);
        Ok(())
    }

    async fn open_segment(&self, job: JobId, name: &str) -> DbResult<Box<dyn SegmentWriter>> {
        let claim = self.live.claim_writer(job)?;
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT start_offset FROM log_segments WHERE job_id = $1 AND name = $2")
                .bind(job.as_uuid())
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_some() {
            return Err(DbError::Duplicate(format!(
                "segment {} of job {}",
                name, job
            )));
        }

        if Self::close_dangling(&mut *tx, job).await? > 0 {
            warn!(job_id = %job, "Closed dangling log segment");
        }

        let (start_offset,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO log_segments (job_id, name, start_offset)
            SELECT $1, $2, COALESCE(MAX(end_offset), 0)
            FROM log_segments
            WHERE job_id = $1
            RETURNING start_offset
            "#,
        )
        .bind(job.as_uuid())
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let segment = LogSegment {
            name: name.to_string(),
            start_offset: start_offset as u64,
            end_offset: None,
        };
        self.live.begin(job, segment.start_offset);
        debug!(job_id = %job, segment = %name, start_offset, "Opened log segment");

        Ok(Box::new(PgSegmentWriter {
            pool: self.pool.clone(),
            live: Arc::clone(&self.live),
            job,
            segment,
            written: 0,
            _claim: claim,
        }))
    }

    async fn read(&self, job: JobId, name: &str, range: Range<u64>) -> DbResult<Bytes> {
        // bytea values are capped well below i32::MAX.
        let start = range.start.min(i32::MAX as u64) as i32;
        let count = range.end.saturating_sub(range.start).min(i32::MAX as u64) as i32;

        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"
            SELECT substring(content FROM $3 + 1 FOR $4)
            FROM log_segments
            WHERE job_id = $1 AND name = $2
            "#,
        )
        .bind(job.as_uuid())
        .bind(name)
        .bind(start)
        .bind(count)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(content,)| Bytes::from(content))
            .ok_or_else(|| DbError::NotFound(format!("segment {} of job {}", name, job)))
    }

    async fn segments(&self, job: JobId) -> DbResult<Vec<LogSegment>> {
        let rows = sqlx::query_as::<_, SegmentRow>(
            r#"
            SELECT name, start_offset, end_offset
            FROM log_segments
            WHERE job_id = $1
            ORDER BY start_offset ASC, end_offset ASC NULLS LAST
            "#,
        )
        .bind(job.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LogSegment::from).collect())
    }

    fn tail(&self, job: JobId, from: u64) -> BoxStream<'static, DbResult<Bytes>> {
        follow(self.clone(), &self.live, job, from)
    }

    async fn finish(&self, job: JobId) -> DbResult<()> {
        let result = Self::close_dangling(&self.pool, job).await;
        self.live.finish(job);
        if result? > 0 {
            warn!(job_id = %job, "Closed dangling log segment");
        }
        Ok(())
    }
}

struct PgSegmentWriter {
    pool: PgPool,
    live: Arc<LiveLogs>,
    job: JobId,
    segment: LogSegment,
    written: u64,
    _claim: WriterClaim,
}

#[async_trait]
impl SegmentWriter for PgSegmentWriter {
    fn segment(&self) -> &LogSegment {
        &self.segment
    }

    fn offset(&self) -> u64 {
        self.segment.start_offset + self.written
    }

    async fn append(&mut self, data: &[u8]) -> DbResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let result = sqlx::query(
            r#"
            UPDATE log_segments
            SET content = content || $3
            WHERE job_id = $1 AND name = $2 AND end_offset IS NULL
            "#,
        )
        .bind(self.job.as_uuid())
        .bind(&self.segment.name)
        .bind(data)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::SegmentClosed(self.segment.name.clone()));
        }

        self.written += data.len() as u64;
        self.live.advance(self.job, self.offset());
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> DbResult<LogSegment> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE log_segments
            SET end_offset = start_offset + octet_length(content)
            WHERE job_id = $1 AND name = $2 AND end_offset IS NULL
            RETURNING end_offset
            "#,
        )
        .bind(self.job.as_uuid())
        .bind(&self.segment.name)
        .fetch_optional(&self.pool)
        .await?;

        let (end_offset,) = row.ok_or_else(|| DbError::SegmentClosed(self.segment.name.clone()))?;
        self.segment.end_offset = Some(end_offset as u64);
        debug!(job_id = %self.job, segment = %self.segment.name, end_offset, "Closed log segment");
        Ok(self.segment.clone())
    }
}
