//! Pipeline endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use deployx_core::{Pipeline, PipelineId, PipelineStatus, RepositoryId};
use deployx_scheduler::{PipelineDetail, PipelineQuery};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_pipelines))
        .route("/{id}", get(get_pipeline))
        .route("/{id}/cancel", post(cancel_pipeline))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPipelinesQuery {
    pub repository_id: Option<Uuid>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PipelineListResponse {
    pub pipelines: Vec<Pipeline>,
    pub total: usize,
}

async fn list_pipelines(
    State(state): State<AppState>,
    Query(query): Query<ListPipelinesQuery>,
) -> Result<Json<PipelineListResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<PipelineStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let pipelines = state
        .controller
        .pipelines(PipelineQuery {
            repository_id: query.repository_id.map(RepositoryId::from_uuid),
            status,
            limit: query.limit,
        })
        .await?;

    Ok(Json(PipelineListResponse {
        total: pipelines.len(),
        pipelines,
    }))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PipelineDetail>, ApiError> {
    Ok(Json(
        state.controller.pipeline(PipelineId::from_uuid(id)).await?,
    ))
}

/// Idempotent: cancelling a finished pipeline returns it unchanged.
async fn cancel_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Pipeline>, ApiError> {
    Ok(Json(
        state.controller.cancel(PipelineId::from_uuid(id)).await?,
    ))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::TestApp;
    use axum::http::StatusCode;
    use serde_json::json;

    async fn trigger(app: &TestApp, repository_id: &str) -> String {
        let (status, body) = app
            .json(
                "POST",
                &format!("/repositories/{}/pipelines", repository_id),
                json!({ "branch": "release", "commitId": "abc123" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["pipelineId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_pipeline_detail_lists_jobs_in_order() {
        let app = TestApp::new();
        let repo = app.repository("https://git.example.com/app.git").await;
        let id = trigger(&app, &repo).await;

        let (status, body) = app.get(&format!("/pipelines/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pipeline"]["branch"], "release");
        assert_eq!(body["pipeline"]["commitId"], "abc123");
        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["name"], "build");
        assert_eq!(jobs[1]["name"], "test");
        assert_eq!(jobs[0]["status"], "QUEUED");
    }

    #[tokio::test]
    async fn test_list_filters_and_limits() {
        let app = TestApp::new();
        let first = app.repository("https://git.example.com/one.git").await;
        let second = app.repository("https://git.example.com/two.git").await;
        trigger(&app, &first).await;
        trigger(&app, &first).await;
        let newest = trigger(&app, &second).await;

        let (status, body) = app.get("/pipelines").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        assert_eq!(body["pipelines"][0]["id"], newest.as_str());

        let (_, body) = app
            .get(&format!("/pipelines?repositoryId={}", first))
            .await;
        assert_eq!(body["total"], 2);

        let (_, body) = app.get("/pipelines?limit=1").await;
        assert_eq!(body["total"], 1);

        let (_, body) = app.get("/pipelines?status=SUCCESS").await;
        assert_eq!(body["total"], 0);

        let (status, _) = app.get("/pipelines?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let app = TestApp::new();
        let repo = app.repository("https://git.example.com/app.git").await;
        let id = trigger(&app, &repo).await;
        let uri = format!("/pipelines/{}/cancel", id);

        let (status, body) = app.json("POST", &uri, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "CANCELLED");

        let (status, body) = app.json("POST", &uri, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "CANCELLED");

        let (_, body) = app.get(&format!("/pipelines/{}", id)).await;
        for job in body["jobs"].as_array().unwrap() {
            assert_eq!(job["status"], "CANCELLED");
        }
    }

    #[tokio::test]
    async fn test_unknown_pipeline() {
        let app = TestApp::new();
        let (status, _) = app
            .get(&format!("/pipelines/{}", uuid::Uuid::new_v4()))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
