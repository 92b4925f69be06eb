//! Repository (source repo) records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deployx_core::{Repository, RepositoryId, RepositoryStats};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// Fields to change on a repository. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct RepositoryUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
}

#[async_trait]
pub trait RepositoryRepo: Send + Sync {
    async fn create(
        &self,
        name: &str,
        url: &str,
        description: Option<&str>,
    ) -> DbResult<Repository>;
    async fn get_by_id(&self, id: RepositoryId) -> DbResult<Repository>;
    async fn get_by_url(&self, url: &str) -> DbResult<Option<Repository>>;
    /// All repositories, newest first.
    async fn list(&self) -> DbResult<Vec<Repository>>;
    async fn update(&self, id: RepositoryId, update: RepositoryUpdate) -> DbResult<Repository>;
    /// Delete a repository together with its pipelines, jobs and webhooks.
    async fn delete(&self, id: RepositoryId) -> DbResult<()>;
    async fn stats(&self, id: RepositoryId) -> DbResult<RepositoryStats>;
}

#[derive(Debug, sqlx::FromRow)]
struct RepositoryRow {
    id: uuid::Uuid,
    name: String,
    url: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        Repository {
            id: RepositoryId::from_uuid(row.id),
            name: row.name,
            url: row.url,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// PostgreSQL implementation of RepositoryRepo.
pub struct PgRepositoryRepo {
    pool: PgPool,
}

impl PgRepositoryRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RepositoryRepo for PgRepositoryRepo {
    async fn create(
        &self,
        name: &str,
        url: &str,
        description: Option<&str>,
    ) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            INSERT INTO repositories (id, name, url, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(name)
        .bind(url)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, format!("repository with url {}", url)))?;
        Ok(row.into())
    }

    async fn get_by_id(&self, id: RepositoryId) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))?;
        Ok(row.into())
    }

    async fn get_by_url(&self, url: &str) -> DbResult<Option<Repository>> {
        let row = sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE url = $1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list(&self) -> DbResult<Vec<Repository>> {
        let rows = sqlx::query_as::<_, RepositoryRow>(
            "SELECT * FROM repositories ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update(&self, id: RepositoryId, update: RepositoryUpdate) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            UPDATE repositories
            SET name = COALESCE($2, name),
                url = COALESCE($3, url),
                description = COALESCE($4, description),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(update.name)
        .bind(update.url)
        .bind(update.description)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, "repository with that url"))?
        .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))?;
        Ok(row.into())
    }

    async fn delete(&self, id: RepositoryId) -> DbResult<()> {
        // pipelines, jobs and webhooks cascade
        let result = sqlx::query("DELETE FROM repositories WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("repository {}", id)));
        }
        Ok(())
    }

    async fn stats(&self, id: RepositoryId) -> DbResult<RepositoryStats> {
        let (total_pipelines, successful, failed, running) =
            sqlx::query_as::<_, (i64, i64, i64, i64)>(
                r#"
                SELECT
                    COUNT(*),
                    COUNT(*) FILTER (WHERE status = 'SUCCESS'),
                    COUNT(*) FILTER (WHERE status = 'FAILED'),
                    COUNT(*) FILTER (WHERE status = 'RUNNING')
                FROM pipelines
                WHERE repository_id = $1
                "#,
            )
            .bind(id.as_uuid())
            .fetch_one(&self.pool)
            .await?;

        Ok(RepositoryStats {
            total_pipelines,
            successful,
            failed,
            running,
        })
    }
}
