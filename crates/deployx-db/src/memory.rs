//! In-memory record store.
//!
//! Implements every repository trait over one mutex-guarded state, so each
//! conditional write is atomic with respect to all others. Used by
//! `--in-memory` servers and by tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use deployx_core::{
    Job, JobId, JobStatus, Pipeline, PipelineId, PipelineStatus, Repository, RepositoryId,
    RepositoryStats, Step, Webhook, WebhookId, WebhookProvider,
};
use tokio::sync::Mutex;

use crate::repo::{
    JobRepo, NewPipeline, PipelineFilter, PipelineRepo, RepositoryRepo, RepositoryUpdate,
    WebhookRepo,
};
use crate::{DbError, DbResult};

#[derive(Default)]
struct State {
    repositories: HashMap<RepositoryId, Repository>,
    pipelines: HashMap<PipelineId, Pipeline>,
    jobs: HashMap<JobId, Job>,
    webhooks: HashMap<WebhookId, Webhook>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RepositoryRepo for MemoryStore {
    async fn create(
        &self,
        name: &str,
        url: &str,
        description: Option<&str>,
    ) -> DbResult<Repository> {
        let mut state = self.state.lock().await;
        if state.repositories.values().any(|r| r.url == url) {
            return Err(DbError::Duplicate(format!("repository with url {}", url)));
        }
        let now = Utc::now();
        let repository = Repository {
            id: RepositoryId::new(),
            name: name.to_string(),
            url: url.to_string(),
            description: description.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        state
            .repositories
            .insert(repository.id, repository.clone());
        Ok(repository)
    }

    async fn get_by_id(&self, id: RepositoryId) -> DbResult<Repository> {
        let state = self.state.lock().await;
        state
            .repositories
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))
    }

    async fn get_by_url(&self, url: &str) -> DbResult<Option<Repository>> {
        let state = self.state.lock().await;
        Ok(state.repositories.values().find(|r| r.url == url).cloned())
    }

    async fn list(&self) -> DbResult<Vec<Repository>> {
        let state = self.state.lock().await;
        let mut repositories: Vec<_> = state.repositories.values().cloned().collect();
        repositories.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(repositories)
    }

    async fn update(&self, id: RepositoryId, update: RepositoryUpdate) -> DbResult<Repository> {
        let mut state = self.state.lock().await;
        let url_taken = update.url.as_ref().is_some_and(|url| {
            state
                .repositories
                .values()
                .any(|r| r.id != id && &r.url == url)
        });
        if url_taken {
            return Err(DbError::Duplicate("repository with that url".to_string()));
        }
        let repository = state
            .repositories
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))?;
        if let Some(name) = update.name {
            repository.name = name;
        }
        if let Some(url) = update.url {
            repository.url = url;
        }
        if let Some(description) = update.description {
            repository.description = Some(description);
        }
        repository.updated_at = Utc::now();
        Ok(repository.clone())
    }

    async fn delete(&self, id: RepositoryId) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if state.repositories.remove(&id).is_none() {
            return Err(DbError::NotFound(format!("repository {}", id)));
        }
        state.pipelines.retain(|_, p| p.repository_id != id);
        let pipelines = &state.pipelines;
        let orphaned: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| !pipelines.contains_key(&j.pipeline_id))
            .map(|j| j.id)
            .collect();
        for job_id in orphaned {
            state.jobs.remove(&job_id);
        }
        state.webhooks.retain(|_, w| w.repository_id != id);
        Ok(())
    }

    async fn stats(&self, id: RepositoryId) -> DbResult<RepositoryStats> {
        let state = self.state.lock().await;
        let mut stats = RepositoryStats::default();
        for pipeline in state.pipelines.values().filter(|p| p.repository_id == id) {
            stats.total_pipelines += 1;
            match pipeline.status {
                PipelineStatus::Success => stats.successful += 1,
                PipelineStatus::Failed => stats.failed += 1,
                PipelineStatus::Running => stats.running += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl PipelineRepo for MemoryStore {
    async fn create(&self, new: NewPipeline) -> DbResult<Pipeline> {
        let mut state = self.state.lock().await;
        if !state.repositories.contains_key(&new.repository_id) {
            return Err(DbError::NotFound(format!(
                "repository {}",
                new.repository_id
            )));
        }
        let now = Utc::now();
        let pipeline = Pipeline {
            id: PipelineId::new(),
            repository_id: new.repository_id,
            status: PipelineStatus::Pending,
            branch: new.branch,
            commit_id: new.commit_id,
            triggered_by: new.triggered_by,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        state.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(pipeline)
    }

    async fn start_with_jobs(&self, id: PipelineId, steps: &[Step]) -> DbResult<Vec<Job>> {
        let mut state = self.state.lock().await;
        let pipeline = state
            .pipelines
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))?;
        if pipeline.status != PipelineStatus::Pending {
            return Err(DbError::Conflict(format!(
                "pipeline {} is {} and cannot receive jobs",
                id, pipeline.status
            )));
        }
        let now = Utc::now();
        pipeline.status = PipelineStatus::Running;
        pipeline.updated_at = now;

        let jobs: Vec<Job> = steps
            .iter()
            .enumerate()
            .map(|(position, step)| Job {
                id: JobId::new(),
                pipeline_id: id,
                position: position as i32,
                name: step.name.clone(),
                command: step.command.clone(),
                status: JobStatus::Queued,
                attempt: 0,
                logs: String::new(),
                created_at: now,
                started_at: None,
                completed_at: None,
            })
            .collect();
        for job in &jobs {
            state.jobs.insert(job.id, job.clone());
        }
        Ok(jobs)
    }

    async fn get(&self, id: PipelineId) -> DbResult<Pipeline> {
        let state = self.state.lock().await;
        state
            .pipelines
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))
    }

    async fn list(&self, filter: &PipelineFilter) -> DbResult<Vec<Pipeline>> {
        let state = self.state.lock().await;
        let mut pipelines: Vec<_> = state
            .pipelines
            .values()
            .filter(|p| filter.repository_id.is_none_or(|id| p.repository_id == id))
            .filter(|p| filter.status.is_none_or(|s| p.status == s))
            .cloned()
            .collect();
        pipelines.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        pipelines.truncate(filter.limit.max(0) as usize);
        Ok(pipelines)
    }

    async fn finalize(&self, id: PipelineId, status: PipelineStatus) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let busy = state
            .jobs
            .values()
            .any(|j| j.pipeline_id == id && !j.status.is_terminal());
        let Some(pipeline) = state.pipelines.get_mut(&id) else {
            return Ok(false);
        };
        if busy || pipeline.status != PipelineStatus::Running {
            return Ok(false);
        }
        let now = Utc::now();
        pipeline.status = status;
        pipeline.completed_at = Some(now);
        pipeline.updated_at = now;
        Ok(true)
    }

    async fn cancel(&self, id: PipelineId) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let pipeline = state
            .pipelines
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))?;
        if pipeline.status.is_terminal() {
            return Ok(false);
        }
        let now = Utc::now();
        pipeline.status = PipelineStatus::Cancelled;
        pipeline.completed_at = Some(now);
        pipeline.updated_at = now;

        for job in state
            .jobs
            .values_mut()
            .filter(|j| j.pipeline_id == id && !j.status.is_terminal())
        {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now);
        }
        Ok(true)
    }
}

#[async_trait]
impl JobRepo for MemoryStore {
    async fn get(&self, id: JobId) -> DbResult<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list_by_pipeline(&self, pipeline_id: PipelineId) -> DbResult<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.position);
        Ok(jobs)
    }

    async fn claim(&self, id: JobId) -> DbResult<Option<i32>> {
        let mut state = self.state.lock().await;
        let Some(pipeline_id) = state.jobs.get(&id).map(|j| j.pipeline_id) else {
            return Ok(None);
        };
        let sibling_running = state
            .jobs
            .values()
            .any(|j| j.pipeline_id == pipeline_id && j.id != id && j.status == JobStatus::Running);
        if sibling_running {
            return Ok(None);
        }
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Running;
                job.attempt += 1;
                job.started_at = Some(Utc::now());
                job.completed_at = None;
                Ok(Some(job.attempt))
            }
            _ => Ok(None),
        }
    }

    async fn append_log(&self, id: JobId, attempt: i32, chunk: &str) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running && job.attempt == attempt => {
                job.logs.push_str(chunk);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: JobId,
        attempt: i32,
        status: JobStatus,
        trailer: Option<&str>,
    ) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running && job.attempt == attempt => {
                job.status = status;
                if let Some(trailer) = trailer {
                    job.logs.push_str(trailer);
                }
                job.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_queued(&self, id: JobId, message: &str) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Failed;
                job.logs.push_str(message);
                job.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_for_retry(&self, id: JobId) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get(&id) else {
            return Ok(false);
        };
        let pipeline_id = job.pipeline_id;
        let pipeline_cancelled = state
            .pipelines
            .get(&pipeline_id)
            .is_none_or(|p| p.status == PipelineStatus::Cancelled);
        if job.status != JobStatus::Failed || pipeline_cancelled {
            return Ok(false);
        }

        if let Some(job) = state.jobs.get_mut(&id) {
            job.status = JobStatus::Queued;
            job.logs.clear();
            job.started_at = None;
            job.completed_at = None;
        }
        if let Some(pipeline) = state.pipelines.get_mut(&pipeline_id) {
            if pipeline.status == PipelineStatus::Failed {
                pipeline.status = PipelineStatus::Running;
                pipeline.completed_at = None;
                pipeline.updated_at = Utc::now();
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl WebhookRepo for MemoryStore {
    async fn upsert(
        &self,
        repository_id: RepositoryId,
        provider: WebhookProvider,
        secret: Option<&str>,
    ) -> DbResult<Webhook> {
        let mut state = self.state.lock().await;
        if !state.repositories.contains_key(&repository_id) {
            return Err(DbError::NotFound(format!("repository {}", repository_id)));
        }
        if let Some(existing) = state
            .webhooks
            .values_mut()
            .find(|w| w.repository_id == repository_id && w.provider == provider)
        {
            existing.secret = secret.map(str::to_string);
            existing.is_active = true;
            return Ok(existing.clone());
        }
        let webhook = Webhook {
            id: WebhookId::new(),
            repository_id,
            provider,
            secret: secret.map(str::to_string),
            is_active: true,
            created_at: Utc::now(),
        };
        state.webhooks.insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    async fn find(
        &self,
        repository_id: RepositoryId,
        provider: WebhookProvider,
    ) -> DbResult<Option<Webhook>> {
        let state = self.state.lock().await;
        Ok(state
            .webhooks
            .values()
            .find(|w| w.repository_id == repository_id && w.provider == provider)
            .cloned())
    }

    async fn list_by_repository(&self, repository_id: RepositoryId) -> DbResult<Vec<Webhook>> {
        let state = self.state.lock().await;
        let mut webhooks: Vec<_> = state
            .webhooks
            .values()
            .filter(|w| w.repository_id == repository_id)
            .cloned()
            .collect();
        webhooks.sort_by_key(|w| (w.created_at, w.id));
        Ok(webhooks)
    }

    async fn set_active(&self, id: WebhookId, active: bool) -> DbResult<Webhook> {
        let mut state = self.state.lock().await;
        let webhook = state
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("webhook {}", id)))?;
        webhook.is_active = active;
        Ok(webhook.clone())
    }
}
