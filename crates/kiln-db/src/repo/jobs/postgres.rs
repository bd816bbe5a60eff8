//! PostgreSQL-backed job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::job::PipelineSpec;
use kiln_core::{Job, JobFilter, JobId, LogSegment, Phase, PhaseTransition, TriggerMetadata};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use uuid::Uuid;

use super::JobStore;
use crate::{DbError, DbResult};

/// A job row from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub phase: String,
    pub trigger_info: Json<TriggerMetadata>,
    pub pipeline: Json<PipelineSpec>,
    pub reason: Option<String>,
    pub log_incomplete: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn into_job(self, segments: Vec<LogSegment>) -> DbResult<Job> {
        let phase = self
            .phase
            .parse::<Phase>()
            .map_err(|e| DbError::Corrupt(format!("job {}: {}", self.id, e)))?;
        Ok(Job {
            id: JobId::from(self.id),
            name: self.name,
            phase,
            trigger: self.trigger_info.0,
            pipeline: self.pipeline.0,
            reason: self.reason,
            log_incomplete: self.log_incomplete,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            segments,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SegmentRecord {
    job_id: Uuid,
    name: String,
    start_offset: i64,
    end_offset: Option<i64>,
}

impl From<SegmentRecord> for LogSegment {
    fn from(r: SegmentRecord) -> Self {
        LogSegment {
            name: r.name,
            start_offset: r.start_offset as u64,
            end_offset: r.end_offset.map(|o| o as u64),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TransitionRecord {
    seq: i32,
    from_phase: Option<String>,
    to_phase: String,
    reason: Option<String>,
    at: DateTime<Utc>,
}

impl TryFrom<TransitionRecord> for PhaseTransition {
    type Error = DbError;

    fn try_from(r: TransitionRecord) -> DbResult<Self> {
        let parse = |s: &str| {
            s.parse::<Phase>()
                .map_err(|e| DbError::Corrupt(format!("transition {}: {}", r.seq, e)))
        };
        Ok(PhaseTransition {
            seq: r.seq as u32,
            from: r.from_phase.as_deref().map(parse).transpose()?,
            to: parse(&r.to_phase)?,
            reason: r.reason.clone(),
            at: r.at,
        })
    }
}

/// PostgreSQL implementation of [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_segments(&self, ids: &[Uuid]) -> DbResult<HashMap<Uuid, Vec<LogSegment>>> {
        let records = sqlx::query_as::<_, SegmentRecord>(
            r#"
            SELECT job_id, name, start_offset, end_offset
            FROM job_segments
            WHERE job_id = ANY($1)
            ORDER BY start_offset ASC
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_job: HashMap<Uuid, Vec<LogSegment>> = HashMap::new();
        for record in records {
            by_job
                .entry(record.job_id)
                .or_default()
                .push(record.into());
        }
        Ok(by_job)
    }

    async fn assemble(&self, records: Vec<JobRecord>) -> DbResult<Vec<Job>> {
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut segments = self.load_segments(&ids).await?;
        records
            .into_iter()
            .map(|r| {
                let segs = segments.remove(&r.id).unwrap_or_default();
                r.into_job(segs)
            })
            .collect()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> DbResult<Job> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, name, phase, trigger_info, pipeline, reason, log_incomplete,
                              created_at, started_at, ended_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(job.phase.as_str())
        .bind(Json(&job.trigger))
        .bind(Json(&job.pipeline))
        .bind(&job.reason)
        .bind(job.log_incomplete)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.ended_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(DbError::Duplicate(format!("job {}", job.id)));
            }
            Err(e) => return Err(e.into()),
        }

        sqlx::query(
            r#"
            INSERT INTO job_transitions (job_id, seq, from_phase, to_phase, reason, at)
            VALUES ($1, 0, NULL, $2, NULL, $3)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.phase.as_str())
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job.clone())
    }

    async fn update_status(&self, id: JobId, phase: Phase, reason: Option<&str>) -> DbResult<Job> {
        let mut tx = self.pool.begin().await?;

        let record =
            sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        let mut job = record.into_job(Vec::new())?;
        let from = job.phase;
        let at = Utc::now();
        job.transition(phase, reason.map(str::to_string), at)
            .map_err(|e| DbError::Conflict(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET phase = $2, reason = $3, started_at = $4, ended_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(job.phase.as_str())
        .bind(&job.reason)
        .bind(job.started_at)
        .bind(job.ended_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO job_transitions (job_id, seq, from_phase, to_phase, reason, at)
            SELECT $1, COALESCE(MAX(seq), -1) + 1, $2, $3, $4, $5
            FROM job_transitions
            WHERE job_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(phase.as_str())
        .bind(reason)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        job.segments = self
            .load_segments(&[*id.as_uuid()])
            .await?
            .remove(id.as_uuid())
            .unwrap_or_default();
        Ok(job)
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        self.assemble(vec![record])
            .await?
            .pop()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list(&self, filter: &JobFilter) -> DbResult<Vec<Job>> {
        let mut query: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT * FROM jobs WHERE TRUE");

        if !filter.phases.is_empty() {
            let phases: Vec<String> = filter
                .phases
                .iter()
                .map(|p| p.as_str().to_string())
                .collect();
            query.push(" AND phase = ANY(").push_bind(phases).push(")");
        }
        if let Some(name) = &filter.name_contains {
            let escaped = name
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            query
                .push(" AND name ILIKE ")
                .push_bind(format!("%{}%", escaped));
        }
        query.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let records = query
            .build_query_as::<JobRecord>()
            .fetch_all(&self.pool)
            .await?;
        self.assemble(records).await
    }

    async fn transitions(&self, id: JobId) -> DbResult<Vec<PhaseTransition>> {
        let records = sqlx::query_as::<_, TransitionRecord>(
            r#"
            SELECT seq, from_phase, to_phase, reason, at
            FROM job_transitions
            WHERE job_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        if records.is_empty() {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        records.into_iter().map(PhaseTransition::try_from).collect()
    }

    async fn record_segment(&self, id: JobId, segment: &LogSegment) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_segments (job_id, name, start_offset, end_offset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id, name)
            DO UPDATE SET start_offset = EXCLUDED.start_offset, end_offset = EXCLUDED.end_offset
            "#,
        )
        .bind(id.as_uuid())
        .bind(&segment.name)
        .bind(segment.start_offset as i64)
        .bind(segment.end_offset.map(|o| o as i64))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                Err(DbError::NotFound(format!("job {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_log_incomplete(&self, id: JobId) -> DbResult<()> {
        let result = sqlx::query("UPDATE jobs SET log_incomplete = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(phase: &str) -> JobRecord {
        JobRecord {
            id: Uuid::now_v7(),
            name: "build-123".to_string(),
            phase: phase.to_string(),
            trigger_info: Json(TriggerMetadata::default()),
            pipeline: Json(PipelineSpec {
                image: "alpine:3.20".to_string(),
                command: vec!["make".to_string()],
                working_dir: None,
                env: HashMap::new(),
                profile: "default".to_string(),
                timeout_secs: Some(600),
            }),
            reason: None,
            log_incomplete: false,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn test_record_into_job() {
        let record = make_record("running");
        let id = record.id;
        let job = record
            .into_job(vec![LogSegment {
                name: "build".to_string(),
                start_offset: 0,
                end_offset: None,
            }])
            .unwrap();
        assert_eq!(*job.id.as_uuid(), id);
        assert_eq!(job.phase, Phase::Running);
        assert_eq!(job.pipeline.timeout_secs, Some(600));
        assert_eq!(job.segments.len(), 1);
    }

    #[test]
    fn test_record_with_unknown_phase_is_corrupt() {
        let result = make_record("exploded").into_job(Vec::new());
        assert!(matches!(result, Err(DbError::Corrupt(_))));
    }

    #[test]
    fn test_transition_record_conversion() {
        let record = TransitionRecord {
            seq: 2,
            from_phase: Some("scheduled".to_string()),
            to_phase: "running".to_string(),
            reason: None,
            at: Utc::now(),
        };
        let transition = PhaseTransition::try_from(record).unwrap();
        assert_eq!(transition.seq, 2);
        assert_eq!(transition.from, Some(Phase::Scheduled));
        assert_eq!(transition.to, Phase::Running);
    }
}
