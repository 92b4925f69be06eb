//! Repository management endpoints, including pipeline triggers and webhook
//! registration scoped to a repository.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::optional_json;
use deployx_core::{Repository, RepositoryId, Webhook, WebhookProvider};
use deployx_db::RepositoryUpdate;
use deployx_scheduler::{RepositoryDetail, TriggerReceipt, TriggerRequest};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_repositories).post(create_repository))
        .route(
            "/{id}",
            get(get_repository)
                .patch(update_repository)
                .delete(delete_repository),
        )
        .route("/{id}/pipelines", post(trigger_pipeline))
        .route("/{id}/webhooks", get(list_webhooks).post(register_webhook))
}

#[derive(Debug, Deserialize)]
pub struct CreateRepositoryRequest {
    pub name: String,
    pub url: String,
    pub description: Option<String>,
}

async fn create_repository(
    State(state): State<AppState>,
    Json(req): Json<CreateRepositoryRequest>,
) -> Result<(StatusCode, Json<Repository>), ApiError> {
    let repository = state
        .controller
        .create_repository(&req.name, &req.url, req.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(repository)))
}

async fn list_repositories(
    State(state): State<AppState>,
) -> Result<Json<Vec<Repository>>, ApiError> {
    Ok(Json(state.controller.repositories().await?))
}

async fn get_repository(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RepositoryDetail>, ApiError> {
    let detail = state
        .controller
        .repository(RepositoryId::from_uuid(id))
        .await?;
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRepositoryRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
}

async fn update_repository(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateRepositoryRequest>,
) -> Result<Json<Repository>, ApiError> {
    let update = RepositoryUpdate {
        name: req.name,
        url: req.url,
        description: req.description,
    };
    let repository = state
        .controller
        .update_repository(RepositoryId::from_uuid(id), update)
        .await?;
    Ok(Json(repository))
}

async fn delete_repository(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .controller
        .delete_repository(RepositoryId::from_uuid(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The body is optional; every field has a default.
async fn trigger_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<(StatusCode, Json<TriggerReceipt>), ApiError> {
    let req: TriggerRequest = optional_json(&body)?;
    let receipt = state
        .controller
        .trigger(RepositoryId::from_uuid(id), req)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Debug, Deserialize)]
pub struct RegisterWebhookRequest {
    pub provider: String,
    pub secret: Option<String>,
}

async fn register_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RegisterWebhookRequest>,
) -> Result<(StatusCode, Json<Webhook>), ApiError> {
    let provider: WebhookProvider = req.provider.parse().map_err(ApiError::BadRequest)?;
    let webhook = state
        .controller
        .register_webhook(
            RepositoryId::from_uuid(id),
            provider,
            req.secret.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(webhook)))
}

async fn list_webhooks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Webhook>>, ApiError> {
    let webhooks = state
        .controller
        .webhooks(RepositoryId::from_uuid(id))
        .await?;
    Ok(Json(webhooks))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::TestApp;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_repository_crud() {
        let app = TestApp::new();
        let id = app.repository("https://git.example.com/app.git").await;

        let (status, body) = app.get(&format!("/repositories/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["url"], "https://git.example.com/app.git");
        assert_eq!(body["stats"]["totalPipelines"], 0);

        let (status, body) = app
            .json(
                "PATCH",
                &format!("/repositories/{}", id),
                json!({ "description": "main service" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["description"], "main service");

        let (_, body) = app.get("/repositories").await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = app
            .send(
                Request::delete(format!("/repositories/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = app.get(&format!("/repositories/{}", id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_duplicate_url_rejected() {
        let app = TestApp::new();
        app.repository("https://git.example.com/app.git").await;

        let (status, _) = app
            .json(
                "POST",
                "/repositories",
                json!({ "name": "again", "url": "https://git.example.com/app.git" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trigger_without_body() {
        let app = TestApp::new();
        let id = app.repository("https://git.example.com/app.git").await;

        let (status, body) = app
            .send(
                Request::post(format!("/repositories/{}/pipelines", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["jobsCreated"], 2);
        assert_eq!(body["status"], "RUNNING");
        assert!(body["pipelineId"].is_string());
        assert_eq!(app.queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_trigger_unknown_repository() {
        let app = TestApp::new();
        let (status, _) = app
            .json(
                "POST",
                &format!("/repositories/{}/pipelines", uuid::Uuid::new_v4()),
                json!({ "branch": "main" }),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(app.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_and_list_webhooks() {
        let app = TestApp::new();
        let id = app.repository("https://git.example.com/app.git").await;
        let uri = format!("/repositories/{}/webhooks", id);

        let (status, body) = app
            .json("POST", &uri, json!({ "provider": "github", "secret": "s3cret" }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["provider"], "github");
        assert_eq!(body["isActive"], true);
        // secrets are never echoed back
        assert!(body.get("secret").is_none());

        let (status, _) = app
            .json("POST", &uri, json!({ "provider": "bitbucket" }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = app.get(&uri).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }
}
