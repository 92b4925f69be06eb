//! Job repository.
//!
//! Writes that belong to a running job (`append_log`, `complete`) are guarded
//! by the job's attempt number, so an engine that lost its claim (the job was
//! cancelled, or reset for retry and claimed again) can no longer touch the row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deployx_core::{Job, JobId, JobStatus, PipelineId};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn get(&self, id: JobId) -> DbResult<Job>;

    /// Jobs of a pipeline in manifest order.
    async fn list_by_pipeline(&self, pipeline_id: PipelineId) -> DbResult<Vec<Job>>;

    /// Move a job from `QUEUED` to `RUNNING`, bumping its attempt counter.
    /// Jobs of a pipeline share a workspace, so the claim also requires that
    /// no other job of the same pipeline is running. Returns the new attempt,
    /// or `None` if the job was not queued or a sibling holds the workspace.
    async fn claim(&self, id: JobId) -> DbResult<Option<i32>>;

    /// Append output to a running job's log. Returns `false` if the attempt
    /// no longer owns the job.
    async fn append_log(&self, id: JobId, attempt: i32, chunk: &str) -> DbResult<bool>;

    /// Write a terminal status for a running attempt, appending `trailer` to
    /// the log. Returns `false` if the attempt no longer owns the job.
    async fn complete(
        &self,
        id: JobId,
        attempt: i32,
        status: JobStatus,
        trailer: Option<&str>,
    ) -> DbResult<bool>;

    /// Fail a job that never started (e.g. its workspace could not be
    /// prepared). Returns `false` if the job was not queued.
    async fn fail_queued(&self, id: JobId, message: &str) -> DbResult<bool>;

    /// Reset a `FAILED` job to `QUEUED` with an empty log, reopening a
    /// `FAILED` pipeline to `RUNNING` in the same transaction. Returns
    /// `false` if the job is not failed or its pipeline was cancelled.
    async fn reset_for_retry(&self, id: JobId) -> DbResult<bool>;
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    id: uuid::Uuid,
    pipeline_id: uuid::Uuid,
    position: i32,
    name: String,
    command: String,
    status: String,
    attempt: i32,
    logs: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            pipeline_id: PipelineId::from_uuid(row.pipeline_id),
            position: row.position,
            name: row.name,
            command: row.command,
            status: row.status.parse().map_err(DbError::InvalidData)?,
            attempt: row.attempt,
            logs: row.logs,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// PostgreSQL implementation of JobRepo.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn get(&self, id: JobId) -> DbResult<Job> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?
            .try_into()
    }

    async fn list_by_pipeline(&self, pipeline_id: PipelineId) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE pipeline_id = $1 ORDER BY position ASC",
        )
        .bind(pipeline_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn claim(&self, id: JobId) -> DbResult<Option<i32>> {
        let mut tx = self.pool.begin().await?;

        // claims within one pipeline are serialized on the pipeline row
        let pipeline_id = sqlx::query_scalar::<_, uuid::Uuid>(
            r#"
            SELECT p.id
            FROM pipelines AS p
            JOIN jobs AS j ON j.pipeline_id = p.id
            WHERE j.id = $1
            FOR UPDATE OF p
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        if pipeline_id.is_none() {
            return Ok(None);
        }

        let attempt = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE jobs
            SET status = 'RUNNING', attempt = attempt + 1, started_at = NOW(), completed_at = NULL
            WHERE id = $1
              AND status = 'QUEUED'
              AND NOT EXISTS (
                  SELECT 1 FROM jobs AS s
                  WHERE s.pipeline_id = jobs.pipeline_id
                    AND s.id <> jobs.id
                    AND s.status = 'RUNNING'
              )
            RETURNING attempt
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(attempt)
    }

    async fn append_log(&self, id: JobId, attempt: i32, chunk: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET logs = logs || $3
            WHERE id = $1 AND attempt = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempt)
        .bind(chunk)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: JobId,
        attempt: i32,
        status: JobStatus,
        trailer: Option<&str>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3, logs = logs || $4, completed_at = NOW()
            WHERE id = $1 AND attempt = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempt)
        .bind(status.as_str())
        .bind(trailer.unwrap_or(""))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_queued(&self, id: JobId, message: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'FAILED', logs = logs || $2, completed_at = NOW()
            WHERE id = $1 AND status = 'QUEUED'
            "#,
        )
        .bind(id.as_uuid())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_for_retry(&self, id: JobId) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let pipeline_id = sqlx::query_scalar::<_, uuid::Uuid>(
            r#"
            UPDATE jobs AS j
            SET status = 'QUEUED', logs = '', started_at = NULL, completed_at = NULL
            FROM pipelines AS p
            WHERE j.id = $1
              AND j.status = 'FAILED'
              AND p.id = j.pipeline_id
              AND p.status <> 'CANCELLED'
            RETURNING j.pipeline_id
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(pipeline_id) = pipeline_id else {
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE pipelines
            SET status = 'RUNNING', completed_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'FAILED'
            "#,
        )
        .bind(pipeline_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
