//! Pipeline commands.

use anyhow::Result;
use deployx_core::{Job, Pipeline, PipelineId, PipelineStatus};
use serde::{Deserialize, Serialize};

use super::{short, timestamp};
use crate::client::ApiClient;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerBody {
    branch: Option<String>,
    commit_id: Option<String>,
    triggered_by: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerReceipt {
    pipeline_id: PipelineId,
    jobs_created: usize,
    status: PipelineStatus,
}

#[derive(Debug, Deserialize)]
struct PipelineList {
    pipelines: Vec<Pipeline>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct PipelineDetail {
    pipeline: Pipeline,
    jobs: Vec<Job>,
}

fn cli_user() -> String {
    match std::env::var("USER") {
        Ok(user) if !user.is_empty() => format!("cli:{}", user),
        _ => "cli".to_string(),
    }
}

pub async fn trigger(
    client: &ApiClient,
    repository_id: &str,
    branch: Option<String>,
    commit: Option<String>,
) -> Result<()> {
    let body = TriggerBody {
        branch,
        commit_id: commit,
        triggered_by: cli_user(),
    };
    let receipt: TriggerReceipt = client
        .post(&format!("/repositories/{}/pipelines", repository_id), &body)
        .await?;
    println!(
        "Pipeline {} {} with {} jobs",
        receipt.pipeline_id, receipt.status, receipt.jobs_created
    );
    Ok(())
}

pub fn list_path(repository: Option<&str>, status: Option<&str>, limit: u32) -> String {
    let mut path = format!("/pipelines?limit={}", limit);
    if let Some(repository) = repository {
        path.push_str(&format!("&repositoryId={}", repository));
    }
    if let Some(status) = status {
        path.push_str(&format!("&status={}", status.to_uppercase()));
    }
    path
}

pub async fn list(
    client: &ApiClient,
    repository: Option<String>,
    status: Option<String>,
    limit: u32,
) -> Result<()> {
    let path = list_path(repository.as_deref(), status.as_deref(), limit);
    let list: PipelineList = client.get(&path).await?;
    if list.pipelines.is_empty() {
        println!("No pipelines found");
        return Ok(());
    }

    println!(
        "{:<36}  {:<9}  {:<16}  {:<8}  {:<19}  TRIGGER",
        "ID", "STATUS", "BRANCH", "COMMIT", "CREATED"
    );
    for pipeline in &list.pipelines {
        println!(
            "{:<36}  {:<9}  {:<16}  {:<8}  {:<19}  {}",
            pipeline.id,
            pipeline.status.as_str(),
            pipeline.branch,
            pipeline.commit_id.as_deref().map(short).unwrap_or("-"),
            timestamp(&pipeline.created_at),
            pipeline.triggered_by
        );
    }
    println!("{} pipeline(s)", list.total);
    Ok(())
}

pub async fn show(client: &ApiClient, id: &str) -> Result<()> {
    let detail: PipelineDetail = client.get(&format!("/pipelines/{}", id)).await?;
    let pipeline = detail.pipeline;
    println!("Pipeline:  {}", pipeline.id);
    println!("Status:    {}", pipeline.status);
    println!("Branch:    {}", pipeline.branch);
    if let Some(commit) = &pipeline.commit_id {
        println!("Commit:    {}", commit);
    }
    println!("Trigger:   {}", pipeline.triggered_by);
    println!("Created:   {}", timestamp(&pipeline.created_at));
    if let Some(completed) = &pipeline.completed_at {
        println!("Completed: {}", timestamp(completed));
    }

    println!();
    println!("{:<4}  {:<36}  {:<20}  {:<9}  ATTEMPT", "#", "JOB", "NAME", "STATUS");
    for job in &detail.jobs {
        println!(
            "{:<4}  {:<36}  {:<20}  {:<9}  {}",
            job.position + 1,
            job.id,
            job.name,
            job.status.as_str(),
            job.attempt
        );
    }
    Ok(())
}

pub async fn cancel(client: &ApiClient, id: &str) -> Result<()> {
    let pipeline: Pipeline = client
        .post(&format!("/pipelines/{}/cancel", id), &serde_json::json!({}))
        .await?;
    println!("Pipeline {} is {}", pipeline.id, pipeline.status);
    Ok(())
}
