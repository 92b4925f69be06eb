//! Repository commands.

use anyhow::Result;
use deployx_core::{Repository, RepositoryStats};
use serde::Deserialize;
use serde_json::json;

use super::timestamp;
use crate::client::ApiClient;

#[derive(Debug, Deserialize)]
struct RepositoryDetail {
    #[serde(flatten)]
    repository: Repository,
    stats: RepositoryStats,
}

pub async fn add(
    client: &ApiClient,
    name: &str,
    url: &str,
    description: Option<String>,
) -> Result<()> {
    let repository: Repository = client
        .post(
            "/repositories",
            &json!({ "name": name, "url": url, "description": description }),
        )
        .await?;
    println!("Registered {} ({})", repository.name, repository.id);
    Ok(())
}

pub async fn list(client: &ApiClient) -> Result<()> {
    let repositories: Vec<Repository> = client.get("/repositories").await?;
    if repositories.is_empty() {
        println!("No repositories registered");
        return Ok(());
    }
    println!("{:<36}  {:<20}  URL", "ID", "NAME");
    for repository in repositories {
        println!(
            "{:<36}  {:<20}  {}",
            repository.id, repository.name, repository.url
        );
    }
    Ok(())
}

pub async fn show(client: &ApiClient, id: &str) -> Result<()> {
    let detail: RepositoryDetail = client.get(&format!("/repositories/{}", id)).await?;
    let repository = detail.repository;
    println!("Repository: {}", repository.name);
    println!("ID:         {}", repository.id);
    println!("URL:        {}", repository.url);
    if let Some(description) = &repository.description {
        println!("About:      {}", description);
    }
    println!("Created:    {}", timestamp(&repository.created_at));
    println!(
        "Pipelines:  {} total, {} succeeded, {} failed, {} running",
        detail.stats.total_pipelines,
        detail.stats.successful,
        detail.stats.failed,
        detail.stats.running
    );
    Ok(())
}

pub async fn delete(client: &ApiClient, id: &str) -> Result<()> {
    client.delete(&format!("/repositories/{}", id)).await?;
    println!("Deleted repository {}", id);
    Ok(())
}
