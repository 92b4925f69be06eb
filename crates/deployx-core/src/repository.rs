//! Registered repositories, webhooks and inbound push events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RepositoryId, WebhookId};

/// A registered source repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    /// Clone URL used to materialize workspaces and to match webhooks.
    pub url: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pipeline counts for a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStats {
    pub total_pipelines: i64,
    pub successful: i64,
    pub failed: i64,
    pub running: i64,
}

/// Git hosting provider that delivers webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookProvider {
    Github,
    Gitlab,
}

impl WebhookProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookProvider::Github => "github",
            WebhookProvider::Gitlab => "gitlab",
        }
    }
}

impl std::fmt::Display for WebhookProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WebhookProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(WebhookProvider::Github),
            "gitlab" => Ok(WebhookProvider::Gitlab),
            _ => Err(format!("Unknown webhook provider: {}", s)),
        }
    }
}

/// Webhook registration for a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: WebhookId,
    pub repository_id: RepositoryId,
    pub provider: WebhookProvider,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A push event normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    /// URL the provider reports for the pushed repository.
    pub repository_url: String,
    pub r#ref: String,
    pub branch: Option<String>,
    pub commit_id: Option<String>,
    pub pusher: String,
}

impl PushEvent {
    /// Parse a GitHub `push` webhook payload.
    pub fn from_github_payload(payload: &serde_json::Value) -> Option<Self> {
        let repository = payload.get("repository")?;
        let repository_url = match repository.get("clone_url").and_then(|u| u.as_str()) {
            Some(url) => url.to_string(),
            None => format!("{}.git", repository.get("html_url")?.as_str()?),
        };
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let commit_id = payload
            .get("after")
            .and_then(|a| a.as_str())
            .map(String::from);

        let pusher = payload.get("pusher");
        let pusher = pusher
            .and_then(|p| p.get("name"))
            .or_else(|| pusher.and_then(|p| p.get("email")))
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
            .to_string();

        Some(PushEvent {
            repository_url,
            branch: branch_from_ref(&r#ref),
            r#ref,
            commit_id,
            pusher,
        })
    }

    /// Parse a GitLab `Push Hook` payload.
    pub fn from_gitlab_payload(payload: &serde_json::Value) -> Option<Self> {
        let repository_url = payload
            .get("project")?
            .get("git_http_url")?
            .as_str()?
            .to_string();
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let commit_id = payload
            .get("checkout_sha")
            .and_then(|c| c.as_str())
            .map(String::from);
        let pusher = payload
            .get("user_username")
            .or_else(|| payload.get("user_name"))
            .and_then(|u| u.as_str())
            .unwrap_or("unknown")
            .to_string();

        Some(PushEvent {
            repository_url,
            branch: branch_from_ref(&r#ref),
            r#ref,
            commit_id,
            pusher,
        })
    }
}

fn branch_from_ref(r#ref: &str) -> Option<String> {
    r#ref.strip_prefix("refs/heads/").map(String::from)
}
