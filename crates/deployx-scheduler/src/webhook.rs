//! Webhook ingestion: signature verification and push-to-trigger mapping.

use std::sync::Arc;

use deployx_core::repository::PushEvent;
use deployx_core::{Error, Result, WebhookProvider};
use deployx_db::Store;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::controller::{PipelineController, TriggerReceipt, TriggerRequest};

/// The provider-specific parts of an incoming webhook request.
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    /// `X-GitHub-Event` or `X-Gitlab-Event`.
    pub event: Option<&'a str>,
    /// `X-Hub-Signature-256` for GitHub, `X-Gitlab-Token` for GitLab.
    pub signature: Option<&'a str>,
    /// The raw request body, exactly as received.
    pub body: &'a [u8],
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum WebhookOutcome {
    Triggered(TriggerReceipt),
    Pong,
    Ignored { reason: String },
}

impl WebhookOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        WebhookOutcome::Ignored {
            reason: reason.into(),
        }
    }
}

pub struct WebhookGate {
    store: Store,
    controller: Arc<PipelineController>,
}

impl WebhookGate {
    pub fn new(store: Store, controller: Arc<PipelineController>) -> Self {
        Self { store, controller }
    }

    pub async fn handle(
        &self,
        provider: WebhookProvider,
        request: WebhookRequest<'_>,
    ) -> Result<WebhookOutcome> {
        let event = request.event.unwrap_or("unknown");
        let payload: serde_json::Value = serde_json::from_slice(request.body)
            .map_err(|e| Error::Validation(format!("invalid webhook payload: {}", e)))?;

        let Some(url) = repository_url(provider, &payload) else {
            return Ok(if is_ping(provider, event) {
                WebhookOutcome::Pong
            } else {
                WebhookOutcome::ignored("payload names no repository")
            });
        };

        info!(provider = %provider, event = %event, url = %url, "Received webhook");

        let repository = self
            .store
            .repositories
            .get_by_url(&url)
            .await?
            .ok_or_else(|| Error::NotFound(format!("repository with url {}", url)))?;

        let webhook = self.store.webhooks.find(repository.id, provider).await?;
        if let Some(secret) = webhook.as_ref().and_then(|w| w.secret.as_deref()) {
            let valid = match provider {
                WebhookProvider::Github => {
                    verify_github_signature(secret, request.body, request.signature)
                }
                WebhookProvider::Gitlab => verify_gitlab_token(secret, request.signature),
            };
            if !valid {
                warn!(repository_id = %repository.id, provider = %provider, "Invalid webhook signature");
                return Err(Error::Signature(format!(
                    "{} webhook signature did not match",
                    provider
                )));
            }
        }
        if webhook.as_ref().is_some_and(|w| !w.is_active) {
            return Ok(WebhookOutcome::ignored("webhook disabled for this repository"));
        }

        if is_ping(provider, event) {
            return Ok(WebhookOutcome::Pong);
        }
        if !is_push(provider, event) {
            return Ok(WebhookOutcome::ignored(format!(
                "event {} is not handled",
                event
            )));
        }
        if payload.get("deleted").and_then(|d| d.as_bool()) == Some(true) {
            return Ok(WebhookOutcome::ignored("branch deleted"));
        }

        let push = match provider {
            WebhookProvider::Github => PushEvent::from_github_payload(&payload),
            WebhookProvider::Gitlab => PushEvent::from_gitlab_payload(&payload),
        }
        .ok_or_else(|| Error::Validation("malformed push payload".to_string()))?;

        let Some(branch) = push.branch else {
            return Ok(WebhookOutcome::ignored(format!(
                "{} is not a branch",
                push.r#ref
            )));
        };

        let receipt = self
            .controller
            .trigger(
                repository.id,
                TriggerRequest {
                    branch: Some(branch),
                    commit_id: push.commit_id,
                    triggered_by: Some(format!("{}:{}", provider, push.pusher)),
                },
            )
            .await?;
        Ok(WebhookOutcome::Triggered(receipt))
    }
}

fn is_ping(provider: WebhookProvider, event: &str) -> bool {
    match provider {
        WebhookProvider::Github => event == "ping",
        WebhookProvider::Gitlab => false,
    }
}

fn is_push(provider: WebhookProvider, event: &str) -> bool {
    match provider {
        WebhookProvider::Github => event == "push",
        WebhookProvider::Gitlab => event == "Push Hook",
    }
}

fn repository_url(provider: WebhookProvider, payload: &serde_json::Value) -> Option<String> {
    match provider {
        WebhookProvider::Github => {
            let repository = payload.get("repository")?;
            match repository.get("clone_url").and_then(|u| u.as_str()) {
                Some(url) => Some(url.to_string()),
                None => Some(format!(
                    "{}.git",
                    repository.get("html_url")?.as_str()?
                )),
            }
        }
        WebhookProvider::Gitlab => payload
            .get("project")?
            .get("git_http_url")?
            .as_str()
            .map(String::from),
    }
}

/// Verify a GitHub `X-Hub-Signature-256` header (`sha256=<hex>`).
fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(sig_hex) = signature.and_then(|s| s.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Compare a GitLab `X-Gitlab-Token` against the secret without leaking
/// where they differ.
fn verify_gitlab_token(secret: &str, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return false;
    };
    let expected = Sha256::digest(secret.as_bytes());
    let actual = Sha256::digest(token.as_bytes());
    expected
        .iter()
        .zip(actual.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
