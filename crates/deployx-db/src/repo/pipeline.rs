//! Pipeline repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deployx_core::{Job, Pipeline, PipelineId, PipelineStatus, RepositoryId, Step};
use sqlx::PgPool;

use crate::repo::job::JobRow;
use crate::{DbError, DbResult};

/// Input for a new pipeline row.
#[derive(Debug, Clone)]
pub struct NewPipeline {
    pub repository_id: RepositoryId,
    pub branch: String,
    pub commit_id: Option<String>,
    pub triggered_by: String,
}

/// Filter for listing pipelines.
#[derive(Debug, Clone)]
pub struct PipelineFilter {
    pub repository_id: Option<RepositoryId>,
    pub status: Option<PipelineStatus>,
    pub limit: i64,
}

impl Default for PipelineFilter {
    fn default() -> Self {
        Self {
            repository_id: None,
            status: None,
            limit: 50,
        }
    }
}

#[async_trait]
pub trait PipelineRepo: Send + Sync {
    /// Insert a pipeline in `PENDING`.
    async fn create(&self, new: NewPipeline) -> DbResult<Pipeline>;

    /// Insert one `QUEUED` job per step and move the pipeline from `PENDING`
    /// to `RUNNING`, all in one transaction.
    async fn start_with_jobs(&self, id: PipelineId, steps: &[Step]) -> DbResult<Vec<Job>>;

    async fn get(&self, id: PipelineId) -> DbResult<Pipeline>;

    /// Pipelines matching the filter, newest first.
    async fn list(&self, filter: &PipelineFilter) -> DbResult<Vec<Pipeline>>;

    /// Write a terminal status iff the pipeline is still `RUNNING` and none of
    /// its jobs is queued or running. Returns whether this call made the write.
    async fn finalize(&self, id: PipelineId, status: PipelineStatus) -> DbResult<bool>;

    /// Cancel a non-terminal pipeline and all of its non-terminal jobs.
    /// Returns `false` if the pipeline was already terminal.
    async fn cancel(&self, id: PipelineId) -> DbResult<bool>;
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PipelineRow {
    id: uuid::Uuid,
    repository_id: uuid::Uuid,
    status: String,
    branch: String,
    commit_id: Option<String>,
    triggered_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = DbError;

    fn try_from(row: PipelineRow) -> DbResult<Self> {
        Ok(Pipeline {
            id: PipelineId::from_uuid(row.id),
            repository_id: RepositoryId::from_uuid(row.repository_id),
            status: row.status.parse().map_err(DbError::InvalidData)?,
            branch: row.branch,
            commit_id: row.commit_id,
            triggered_by: row.triggered_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// PostgreSQL implementation of PipelineRepo.
pub struct PgPipelineRepo {
    pool: PgPool,
}

impl PgPipelineRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineRepo for PgPipelineRepo {
    async fn create(&self, new: NewPipeline) -> DbResult<Pipeline> {
        let row = sqlx::query_as::<_, PipelineRow>(
            r#"
            INSERT INTO pipelines (id, repository_id, status, branch, commit_id, triggered_by, created_at, updated_at)
            VALUES ($1, $2, 'PENDING', $3, $4, $5, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(new.repository_id.as_uuid())
        .bind(&new.branch)
        .bind(&new.commit_id)
        .bind(&new.triggered_by)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn start_with_jobs(&self, id: PipelineId, steps: &[Step]) -> DbResult<Vec<Job>> {
        let mut tx = self.pool.begin().await?;

        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM pipelines WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))?;

        if status != PipelineStatus::Pending.as_str() {
            return Err(DbError::Conflict(format!(
                "pipeline {} is {} and cannot receive jobs",
                id, status
            )));
        }

        let mut jobs = Vec::with_capacity(steps.len());
        for (position, step) in steps.iter().enumerate() {
            let row = sqlx::query_as::<_, JobRow>(
                r#"
                INSERT INTO jobs (id, pipeline_id, position, name, command, status, attempt, logs, created_at)
                VALUES ($1, $2, $3, $4, $5, 'QUEUED', 0, '', NOW())
                RETURNING *
                "#,
            )
            .bind(uuid::Uuid::now_v7())
            .bind(id.as_uuid())
            .bind(position as i32)
            .bind(&step.name)
            .bind(&step.command)
            .fetch_one(&mut *tx)
            .await?;
            jobs.push(row.try_into()?);
        }

        sqlx::query("UPDATE pipelines SET status = 'RUNNING', updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(jobs)
    }

    async fn get(&self, id: PipelineId) -> DbResult<Pipeline> {
        sqlx::query_as::<_, PipelineRow>("SELECT * FROM pipelines WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))?
            .try_into()
    }

    async fn list(&self, filter: &PipelineFilter) -> DbResult<Vec<Pipeline>> {
        let mut query_builder =
            sqlx::QueryBuilder::<sqlx::Postgres>::new("SELECT * FROM pipelines WHERE 1=1");

        if let Some(repository_id) = filter.repository_id {
            query_builder
                .push(" AND repository_id = ")
                .push_bind(*repository_id.as_uuid());
        }
        if let Some(status) = filter.status {
            query_builder
                .push(" AND status = ")
                .push_bind(status.as_str());
        }
        query_builder
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit);

        let rows = query_builder
            .build_query_as::<PipelineRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Pipeline::try_from).collect()
    }

    async fn finalize(&self, id: PipelineId, status: PipelineStatus) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET status = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
              AND status = 'RUNNING'
              AND NOT EXISTS (
                  SELECT 1 FROM jobs
                  WHERE pipeline_id = $1 AND status IN ('QUEUED', 'RUNNING')
              )
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel(&self, id: PipelineId) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE pipelines
            SET status = 'CANCELLED', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let exists = sqlx::query_scalar::<_, i32>("SELECT 1 FROM pipelines WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            return if exists {
                Ok(false)
            } else {
                Err(DbError::NotFound(format!("pipeline {}", id)))
            };
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'CANCELLED', completed_at = NOW()
            WHERE pipeline_id = $1 AND status IN ('QUEUED', 'RUNNING')
            "#,
        )
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
