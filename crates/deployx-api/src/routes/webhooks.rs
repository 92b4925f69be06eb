//! Webhook endpoints for Git providers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use deployx_core::{Webhook, WebhookId, WebhookProvider};
use deployx_scheduler::{WebhookOutcome, WebhookRequest};

pub fn router() -> Router<AppState> {
    // the segment is a provider name for deliveries and a webhook id for updates
    Router::new().route("/{key}", post(receive_webhook).patch(update_webhook))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Handle a delivery from GitHub or GitLab.
async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, ApiError> {
    let provider: WebhookProvider = provider.parse().map_err(ApiError::NotFound)?;
    let (event_header, signature_header) = match provider {
        WebhookProvider::Github => ("X-GitHub-Event", "X-Hub-Signature-256"),
        WebhookProvider::Gitlab => ("X-Gitlab-Event", "X-Gitlab-Token"),
    };

    let request = WebhookRequest {
        event: header(&headers, event_header),
        signature: header(&headers, signature_header),
        body: &body,
    };
    let outcome = state.webhooks.handle(provider, request).await?;

    if let WebhookOutcome::Triggered(receipt) = &outcome {
        info!(
            provider = %provider,
            pipeline_id = %receipt.pipeline_id,
            "Pipeline triggered by webhook"
        );
    }
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhookRequest {
    pub is_active: bool,
}

async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateWebhookRequest>,
) -> Result<Json<Webhook>, ApiError> {
    let id: Uuid = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid webhook id: {}", id)))?;
    let webhook = state
        .controller
        .set_webhook_active(WebhookId::from_uuid(id), req.is_active)
        .await?;
    Ok(Json(webhook))
}
