//! Webhook registrations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deployx_core::{RepositoryId, Webhook, WebhookId, WebhookProvider};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait WebhookRepo: Send + Sync {
    /// Register a webhook, or replace the secret of an existing registration
    /// for the same repository and provider (re-activating it).
    async fn upsert(
        &self,
        repository_id: RepositoryId,
        provider: WebhookProvider,
        secret: Option<&str>,
    ) -> DbResult<Webhook>;
    async fn find(
        &self,
        repository_id: RepositoryId,
        provider: WebhookProvider,
    ) -> DbResult<Option<Webhook>>;
    async fn list_by_repository(&self, repository_id: RepositoryId) -> DbResult<Vec<Webhook>>;
    async fn set_active(&self, id: WebhookId, active: bool) -> DbResult<Webhook>;
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookRow {
    id: uuid::Uuid,
    repository_id: uuid::Uuid,
    provider: String,
    secret: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<WebhookRow> for Webhook {
    type Error = DbError;

    fn try_from(row: WebhookRow) -> DbResult<Self> {
        Ok(Webhook {
            id: WebhookId::from_uuid(row.id),
            repository_id: RepositoryId::from_uuid(row.repository_id),
            provider: row.provider.parse().map_err(DbError::InvalidData)?,
            secret: row.secret,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL implementation of WebhookRepo.
pub struct PgWebhookRepo {
    pool: PgPool,
}

impl PgWebhookRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookRepo for PgWebhookRepo {
    async fn upsert(
        &self,
        repository_id: RepositoryId,
        provider: WebhookProvider,
        secret: Option<&str>,
    ) -> DbResult<Webhook> {
        sqlx::query_as::<_, WebhookRow>(
            r#"
            INSERT INTO webhooks (id, repository_id, provider, secret, is_active, created_at)
            VALUES ($1, $2, $3, $4, TRUE, NOW())
            ON CONFLICT (repository_id, provider)
            DO UPDATE SET secret = EXCLUDED.secret, is_active = TRUE
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(repository_id.as_uuid())
        .bind(provider.as_str())
        .bind(secret)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    async fn find(
        &self,
        repository_id: RepositoryId,
        provider: WebhookProvider,
    ) -> DbResult<Option<Webhook>> {
        let row = sqlx::query_as::<_, WebhookRow>(
            "SELECT * FROM webhooks WHERE repository_id = $1 AND provider = $2",
        )
        .bind(repository_id.as_uuid())
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Webhook::try_from).transpose()
    }

    async fn list_by_repository(&self, repository_id: RepositoryId) -> DbResult<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, WebhookRow>(
            "SELECT * FROM webhooks WHERE repository_id = $1 ORDER BY created_at",
        )
        .bind(repository_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Webhook::try_from).collect()
    }

    async fn set_active(&self, id: WebhookId, active: bool) -> DbResult<Webhook> {
        sqlx::query_as::<_, WebhookRow>(
            "UPDATE webhooks SET is_active = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("webhook {}", id)))?
        .try_into()
    }
}
