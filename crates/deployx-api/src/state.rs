//! Application state.

use std::sync::Arc;
use std::time::Duration;

use deployx_core::manifest::ManifestSource;
use deployx_db::Store;
use deployx_scheduler::{DispatchQueue, LogStreamService, PipelineController, WebhookGate};
use sqlx::PgPool;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<PipelineController>,
    pub logs: Arc<LogStreamService>,
    pub webhooks: Arc<WebhookGate>,
    /// Checked by the readiness probe; `None` when running in memory.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(
        store: Store,
        manifests: Arc<dyn ManifestSource>,
        queue: Arc<dyn DispatchQueue>,
        log_poll_interval: Duration,
    ) -> Self {
        let controller = Arc::new(PipelineController::new(store.clone(), manifests, queue));
        let logs = Arc::new(LogStreamService::new(
            store.jobs.clone(),
            log_poll_interval,
        ));
        let webhooks = Arc::new(WebhookGate::new(store, controller.clone()));

        Self {
            controller,
            logs,
            webhooks,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }
}
