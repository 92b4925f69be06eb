//! Job endpoints and the live log stream.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use deployx_core::{Job, JobId};
use deployx_scheduler::{LogEvent, LogStart};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_job))
        .route("/{id}/logs", get(stream_logs))
        .route("/{id}/retry", post(retry_job))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.controller.job(JobId::from_uuid(id)).await?))
}

async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.controller.retry(JobId::from_uuid(id)).await?))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// `start` (default) or `tail`.
    pub from: Option<String>,
}

/// Server-Sent Events: one `log` event per chunk, then a single `end` event
/// carrying the terminal status. Payloads are JSON so carriage returns in
/// command output survive the SSE framing.
async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let from = query
        .from
        .as_deref()
        .map(str::parse::<LogStart>)
        .transpose()
        .map_err(ApiError::BadRequest)?
        .unwrap_or_default();

    let events = state.logs.subscribe(JobId::from_uuid(id), from).await?;
    let stream = events.map(|event| {
        let name = match &event {
            LogEvent::Chunk { .. } => "log",
            LogEvent::Completed { .. } => "end",
        };
        Event::default().event(name).json_data(&event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
