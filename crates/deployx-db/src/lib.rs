//! Record store for DeployX.
//!
//! Provides repository traits with PostgreSQL and in-memory implementations.

pub mod error;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use repo::*;

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Handles to every repository, shared by the controller, engine and API.
#[derive(Clone)]
pub struct Store {
    pub repositories: Arc<dyn RepositoryRepo>,
    pub pipelines: Arc<dyn PipelineRepo>,
    pub jobs: Arc<dyn JobRepo>,
    pub webhooks: Arc<dyn WebhookRepo>,
}

impl Store {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            repositories: Arc::new(PgRepositoryRepo::new(pool.clone())),
            pipelines: Arc::new(PgPipelineRepo::new(pool.clone())),
            jobs: Arc::new(PgJobRepo::new(pool.clone())),
            webhooks: Arc::new(PgWebhookRepo::new(pool)),
        }
    }

    pub fn memory() -> Self {
        let store = MemoryStore::new();
        Self {
            repositories: Arc::new(store.clone()),
            pipelines: Arc::new(store.clone()),
            jobs: Arc::new(store.clone()),
            webhooks: Arc::new(store),
        }
    }
}
