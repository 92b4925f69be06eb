//! API routes.

pub mod health;
pub mod jobs;
pub mod pipelines;
pub mod repositories;
pub mod webhooks;

use crate::AppState;
use axum::Router;
use axum::body::Bytes;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/repositories", repositories::router())
        .nest("/pipelines", pipelines::router())
        .nest("/jobs", jobs::router())
        .nest("/webhooks", webhooks::router())
        .merge(health::router())
        .with_state(state)
}

/// Parse an optional JSON body; an empty body yields the default value.
pub(crate) fn optional_json<T>(body: &Bytes) -> Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))
}
