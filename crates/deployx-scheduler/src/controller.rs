//! Pipeline controller: triggers, cancellation, retry and read queries.

use std::sync::Arc;

use deployx_core::manifest::{ManifestSource, validate_steps};
use deployx_core::{
    Error, Job, JobId, JobStatus, Pipeline, PipelineId, PipelineStatus, Repository, RepositoryId,
    RepositoryStats, Result, Webhook, WebhookId, WebhookProvider,
};
use deployx_db::{NewPipeline, PipelineFilter, RepositoryUpdate, Store};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::aggregator::StatusAggregator;
use crate::queue::{DispatchQueue, JobPayload};

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_TRIGGER: &str = "manual";
pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 200;

/// Optional inputs of a pipeline trigger.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub branch: Option<String>,
    pub commit_id: Option<String>,
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerReceipt {
    pub pipeline_id: PipelineId,
    pub jobs_created: usize,
    pub status: PipelineStatus,
}

/// A pipeline with its jobs in manifest order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDetail {
    pub pipeline: Pipeline,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryDetail {
    #[serde(flatten)]
    pub repository: Repository,
    pub stats: RepositoryStats,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineQuery {
    pub repository_id: Option<RepositoryId>,
    pub status: Option<PipelineStatus>,
    pub limit: Option<i64>,
}

pub struct PipelineController {
    store: Store,
    manifests: Arc<dyn ManifestSource>,
    queue: Arc<dyn DispatchQueue>,
    aggregator: StatusAggregator,
}

impl PipelineController {
    pub fn new(
        store: Store,
        manifests: Arc<dyn ManifestSource>,
        queue: Arc<dyn DispatchQueue>,
    ) -> Self {
        let aggregator = StatusAggregator::new(store.pipelines.clone(), store.jobs.clone());
        Self {
            store,
            manifests,
            queue,
            aggregator,
        }
    }

    /// Create a pipeline for `repository_id` and dispatch one job per
    /// manifest step.
    pub async fn trigger(
        &self,
        repository_id: RepositoryId,
        request: TriggerRequest,
    ) -> Result<TriggerReceipt> {
        let repository = self.store.repositories.get_by_id(repository_id).await?;

        let branch = non_blank(request.branch).unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        let commit_id = non_blank(request.commit_id);
        let triggered_by =
            non_blank(request.triggered_by).unwrap_or_else(|| DEFAULT_TRIGGER.to_string());

        let steps = self
            .manifests
            .load(&repository, &branch, commit_id.as_deref())
            .await?;
        validate_steps(&steps)?;

        let pipeline = self
            .store
            .pipelines
            .create(NewPipeline {
                repository_id,
                branch,
                commit_id,
                triggered_by,
            })
            .await?;
        let jobs = self
            .store
            .pipelines
            .start_with_jobs(pipeline.id, &steps)
            .await?;

        for job in &jobs {
            if let Err(e) = self
                .queue
                .submit(&payload_for(&repository, &pipeline, job))
                .await
            {
                // jobs without a queue entry would never run
                warn!(
                    pipeline_id = %pipeline.id,
                    error = %e,
                    "Failed to dispatch pipeline, cancelling"
                );
                if let Err(cancel_err) = self.store.pipelines.cancel(pipeline.id).await {
                    warn!(
                        pipeline_id = %pipeline.id,
                        error = %cancel_err,
                        "Failed to cancel undispatched pipeline"
                    );
                }
                return Err(e.into());
            }
        }

        info!(
            pipeline_id = %pipeline.id,
            repository = %repository.name,
            branch = %pipeline.branch,
            triggered_by = %pipeline.triggered_by,
            jobs = jobs.len(),
            "Pipeline triggered"
        );

        Ok(TriggerReceipt {
            pipeline_id: pipeline.id,
            jobs_created: jobs.len(),
            status: PipelineStatus::Running,
        })
    }

    /// Cancel a pipeline and its open jobs. Terminal pipelines are returned
    /// unchanged.
    pub async fn cancel(&self, pipeline_id: PipelineId) -> Result<Pipeline> {
        if self.store.pipelines.cancel(pipeline_id).await? {
            info!(pipeline_id = %pipeline_id, "Pipeline cancelled");
        }
        Ok(self.store.pipelines.get(pipeline_id).await?)
    }

    /// Reset a failed job and dispatch it again.
    pub async fn retry(&self, job_id: JobId) -> Result<Job> {
        let job = self.store.jobs.get(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(Error::Validation(format!(
                "job {} is {}; only FAILED jobs can be retried",
                job_id, job.status
            )));
        }

        let pipeline = self.store.pipelines.get(job.pipeline_id).await?;
        if pipeline.status == PipelineStatus::Cancelled {
            return Err(Error::Validation(format!(
                "pipeline {} was cancelled",
                pipeline.id
            )));
        }
        let repository = self
            .store
            .repositories
            .get_by_id(pipeline.repository_id)
            .await?;

        if !self.store.jobs.reset_for_retry(job_id).await? {
            return Err(Error::Validation(format!(
                "job {} can no longer be retried",
                job_id
            )));
        }

        let job = self.store.jobs.get(job_id).await?;
        if let Err(e) = self
            .queue
            .submit(&payload_for(&repository, &pipeline, &job))
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to dispatch retried job");
            self.undo_retry(&job, &e.to_string()).await;
            return Err(e.into());
        }

        info!(job_id = %job_id, pipeline_id = %pipeline.id, "Job retried");
        Ok(job)
    }

    /// Put a reset job back to FAILED so it can be retried again, and let the
    /// pipeline re-finalize.
    async fn undo_retry(&self, job: &Job, reason: &str) {
        let message = format!("Failed to dispatch retry: {}\n", reason);
        match self.store.jobs.fail_queued(job.id, &message).await {
            Ok(true) => {
                if let Err(e) = self.aggregator.reconcile(job.pipeline_id).await {
                    warn!(
                        pipeline_id = %job.pipeline_id,
                        error = %e,
                        "Failed to reconcile pipeline"
                    );
                }
            }
            Ok(false) => {}
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to restore retried job"),
        }
    }

    pub async fn pipeline(&self, pipeline_id: PipelineId) -> Result<PipelineDetail> {
        let pipeline = self.store.pipelines.get(pipeline_id).await?;
        let jobs = self.store.jobs.list_by_pipeline(pipeline_id).await?;
        Ok(PipelineDetail { pipeline, jobs })
    }

    /// Pipelines matching `query`, newest first.
    pub async fn pipelines(&self, query: PipelineQuery) -> Result<Vec<Pipeline>> {
        let filter = PipelineFilter {
            repository_id: query.repository_id,
            status: query.status,
            limit: query
                .limit
                .unwrap_or(DEFAULT_LIST_LIMIT)
                .clamp(1, MAX_LIST_LIMIT),
        };
        Ok(self.store.pipelines.list(&filter).await?)
    }

    pub async fn job(&self, job_id: JobId) -> Result<Job> {
        Ok(self.store.jobs.get(job_id).await?)
    }

    pub async fn create_repository(
        &self,
        name: &str,
        url: &str,
        description: Option<&str>,
    ) -> Result<Repository> {
        let name = required("name", name)?;
        let url = required("url", url)?;
        let repository = self
            .store
            .repositories
            .create(name, url, description)
            .await?;
        info!(repository_id = %repository.id, url = %repository.url, "Repository registered");
        Ok(repository)
    }

    pub async fn repositories(&self) -> Result<Vec<Repository>> {
        Ok(self.store.repositories.list().await?)
    }

    pub async fn repository(&self, repository_id: RepositoryId) -> Result<RepositoryDetail> {
        let repository = self.store.repositories.get_by_id(repository_id).await?;
        let stats = self.store.repositories.stats(repository_id).await?;
        Ok(RepositoryDetail { repository, stats })
    }

    pub async fn update_repository(
        &self,
        repository_id: RepositoryId,
        update: RepositoryUpdate,
    ) -> Result<Repository> {
        if let Some(name) = &update.name {
            required("name", name)?;
        }
        if let Some(url) = &update.url {
            required("url", url)?;
        }
        Ok(self
            .store
            .repositories
            .update(repository_id, update)
            .await?)
    }

    pub async fn delete_repository(&self, repository_id: RepositoryId) -> Result<()> {
        self.store.repositories.delete(repository_id).await?;
        info!(repository_id = %repository_id, "Repository deleted");
        Ok(())
    }

    /// Register (or re-register) the webhook for a repository and provider.
    pub async fn register_webhook(
        &self,
        repository_id: RepositoryId,
        provider: WebhookProvider,
        secret: Option<&str>,
    ) -> Result<Webhook> {
        self.store.repositories.get_by_id(repository_id).await?;
        let secret = secret.filter(|s| !s.is_empty());
        Ok(self
            .store
            .webhooks
            .upsert(repository_id, provider, secret)
            .await?)
    }

    pub async fn webhooks(&self, repository_id: RepositoryId) -> Result<Vec<Webhook>> {
        self.store.repositories.get_by_id(repository_id).await?;
        Ok(self
            .store
            .webhooks
            .list_by_repository(repository_id)
            .await?)
    }

    pub async fn set_webhook_active(&self, webhook_id: WebhookId, active: bool) -> Result<Webhook> {
        Ok(self.store.webhooks.set_active(webhook_id, active).await?)
    }
}

fn payload_for(repository: &Repository, pipeline: &Pipeline, job: &Job) -> JobPayload {
    JobPayload {
        job_id: job.id,
        pipeline_id: pipeline.id,
        repository_url: repository.url.clone(),
        command: job.command.clone(),
        branch: pipeline.branch.clone(),
        commit_id: pipeline.commit_id.clone(),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{QueueError, QueueResult};
    use crate::queue::{Delivery, MemoryQueue};
    use deployx_core::Step;
    use deployx_core::manifest::StaticManifest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        store: Store,
        queue: Arc<MemoryQueue>,
        controller: PipelineController,
    }

    fn harness(steps: Vec<Step>) -> Harness {
        let store = Store::memory();
        let queue = Arc::new(MemoryQueue::new());
        let controller = PipelineController::new(
            store.clone(),
            Arc::new(StaticManifest::new(steps)),
            queue.clone(),
        );
        Harness {
            store,
            queue,
            controller,
        }
    }

    fn three_steps() -> Vec<Step> {
        vec![
            Step::new("install", "npm ci"),
            Step::new("test", "npm test"),
            Step::new("build", "npm run build"),
        ]
    }

    async fn repository(h: &Harness) -> Repository {
        h.controller
            .create_repository("app", "https://git.example.com/app.git", None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_trigger_creates_queued_jobs() {
        let h = harness(three_steps());
        let repo = repository(&h).await;

        let receipt = h
            .controller
            .trigger(repo.id, TriggerRequest::default())
            .await
            .unwrap();
        assert_eq!(receipt.jobs_created, 3);
        assert_eq!(receipt.status, PipelineStatus::Running);

        let detail = h.controller.pipeline(receipt.pipeline_id).await.unwrap();
        assert_eq!(detail.pipeline.status, PipelineStatus::Running);
        assert_eq!(detail.pipeline.branch, DEFAULT_BRANCH);
        assert_eq!(detail.pipeline.triggered_by, DEFAULT_TRIGGER);
        let names: Vec<_> = detail.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, ["install", "test", "build"]);
        assert!(detail.jobs.iter().all(|j| j.status == JobStatus::Queued));
        assert_eq!(h.queue.len().await, 3);

        let delivery = h.queue.receive("t").await.unwrap().unwrap();
        assert_eq!(delivery.payload.job_id, detail.jobs[0].id);
        assert_eq!(delivery.payload.repository_url, repo.url);
        assert_eq!(delivery.payload.command, "npm ci");
    }

    #[tokio::test]
    async fn test_trigger_unknown_repository() {
        let h = harness(three_steps());
        let err = h
            .controller
            .trigger(RepositoryId::new(), TriggerRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_trigger_with_empty_manifest_creates_nothing() {
        let h = harness(Vec::new());
        let repo = repository(&h).await;

        let err = h
            .controller
            .trigger(repo.id, TriggerRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(
            h.controller
                .pipelines(PipelineQuery::default())
                .await
                .unwrap()
                .is_empty()
        );
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_trigger_keeps_explicit_inputs() {
        let h = harness(three_steps());
        let repo = repository(&h).await;
        let receipt = h
            .controller
            .trigger(
                repo.id,
                TriggerRequest {
                    branch: Some("release".to_string()),
                    commit_id: Some("abc123".to_string()),
                    triggered_by: Some("github:octocat".to_string()),
                },
            )
            .await
            .unwrap();

        let pipeline = h.controller.pipeline(receipt.pipeline_id).await.unwrap().pipeline;
        assert_eq!(pipeline.branch, "release");
        assert_eq!(pipeline.commit_id.as_deref(), Some("abc123"));
        assert_eq!(pipeline.triggered_by, "github:octocat");
    }

    #[tokio::test]
    async fn test_cancel_twice_and_terminal_pipelines() {
        let h = harness(vec![Step::new("only", "true")]);
        let repo = repository(&h).await;
        let receipt = h
            .controller
            .trigger(repo.id, TriggerRequest::default())
            .await
            .unwrap();

        let first = h.controller.cancel(receipt.pipeline_id).await.unwrap();
        assert_eq!(first.status, PipelineStatus::Cancelled);
        let second = h.controller.cancel(receipt.pipeline_id).await.unwrap();
        assert_eq!(second.status, PipelineStatus::Cancelled);
        assert_eq!(first.completed_at, second.completed_at);

        // a finished pipeline is never turned into CANCELLED
        let receipt = h
            .controller
            .trigger(repo.id, TriggerRequest::default())
            .await
            .unwrap();
        let jobs = h.controller.pipeline(receipt.pipeline_id).await.unwrap().jobs;
        let job = &jobs[0];
        let attempt = h.store.jobs.claim(job.id).await.unwrap().unwrap();
        h.store
            .jobs
            .complete(job.id, attempt, JobStatus::Success, None)
            .await
            .unwrap();
        h.store
            .pipelines
            .finalize(receipt.pipeline_id, PipelineStatus::Success)
            .await
            .unwrap();
        let pipeline = h.controller.cancel(receipt.pipeline_id).await.unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Success);

        let err = h.controller.cancel(PipelineId::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_requires_failed_job() {
        let h = harness(three_steps());
        let repo = repository(&h).await;
        let receipt = h
            .controller
            .trigger(repo.id, TriggerRequest::default())
            .await
            .unwrap();
        let jobs = h.controller.pipeline(receipt.pipeline_id).await.unwrap().jobs;

        let err = h.controller.retry(jobs[0].id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = h.controller.retry(JobId::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_rejected_for_cancelled_pipeline() {
        let h = harness(vec![Step::new("only", "false")]);
        let repo = repository(&h).await;
        let receipt = h
            .controller
            .trigger(repo.id, TriggerRequest::default())
            .await
            .unwrap();
        let jobs = h.controller.pipeline(receipt.pipeline_id).await.unwrap().jobs;
        let job = &jobs[0];
        let attempt = h.store.jobs.claim(job.id).await.unwrap().unwrap();
        h.store
            .jobs
            .complete(job.id, attempt, JobStatus::Failed, None)
            .await
            .unwrap();
        h.controller.cancel(receipt.pipeline_id).await.unwrap();

        let err = h.controller.retry(job.id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_list_limit_is_clamped() {
        let h = harness(vec![Step::new("only", "true")]);
        let repo = repository(&h).await;
        for _ in 0..3 {
            h.controller
                .trigger(repo.id, TriggerRequest::default())
                .await
                .unwrap();
        }

        let zero = h
            .controller
            .pipelines(PipelineQuery {
                limit: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(zero.len(), 1);

        let filtered = h
            .controller
            .pipelines(PipelineQuery {
                repository_id: Some(RepositoryId::new()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(filtered.is_empty());

        let detail = h.controller.repository(repo.id).await.unwrap();
        assert_eq!(detail.stats.total_pipelines, 3);
        assert_eq!(detail.stats.running, 3);
    }

    #[tokio::test]
    async fn test_repository_validation() {
        let h = harness(three_steps());
        let err = h
            .controller
            .create_repository("  ", "https://x/a.git", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        repository(&h).await;
        let err = h
            .controller
            .create_repository("dup", "https://git.example.com/app.git", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_webhook_registration() {
        let h = harness(three_steps());
        let repo = repository(&h).await;

        let hook = h
            .controller
            .register_webhook(repo.id, WebhookProvider::Github, Some(""))
            .await
            .unwrap();
        assert!(hook.secret.is_none());
        let hook = h.controller.set_webhook_active(hook.id, false).await.unwrap();
        assert!(!hook.is_active);
        assert_eq!(h.controller.webhooks(repo.id).await.unwrap().len(), 1);

        let err = h
            .controller
            .register_webhook(RepositoryId::new(), WebhookProvider::Gitlab, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    /// Accepts `remaining` submissions, then refuses the next one.
    struct FailingQueue {
        inner: MemoryQueue,
        remaining: AtomicUsize,
    }

    impl FailingQueue {
        fn after(accepted: usize) -> Self {
            Self {
                inner: MemoryQueue::new(),
                remaining: AtomicUsize::new(accepted),
            }
        }
    }

    #[async_trait::async_trait]
    impl DispatchQueue for FailingQueue {
        async fn submit(&self, payload: &JobPayload) -> QueueResult<()> {
            let accepted = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !accepted {
                // later submissions go through again
                self.remaining.store(usize::MAX, Ordering::SeqCst);
                return Err(QueueError::Database(sqlx::Error::PoolClosed));
            }
            self.inner.submit(payload).await
        }

        async fn receive(&self, worker_id: &str) -> QueueResult<Option<Delivery>> {
            self.inner.receive(worker_id).await
        }

        async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
            self.inner.ack(delivery).await
        }

        async fn requeue(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
            self.inner.requeue(delivery, delay).await
        }
    }

    fn failing_controller(
        store: &Store,
        steps: Vec<Step>,
        queue: Arc<FailingQueue>,
    ) -> PipelineController {
        PipelineController::new(store.clone(), Arc::new(StaticManifest::new(steps)), queue)
    }

    #[tokio::test]
    async fn test_retry_dispatch_failure_keeps_job_retryable() {
        let store = Store::memory();
        let queue = Arc::new(FailingQueue::after(1));
        let controller =
            failing_controller(&store, vec![Step::new("only", "false")], queue.clone());
        let repo = controller
            .create_repository("app", "https://git.example.com/app.git", None)
            .await
            .unwrap();
        let receipt = controller
            .trigger(repo.id, TriggerRequest::default())
            .await
            .unwrap();
        let job = controller.pipeline(receipt.pipeline_id).await.unwrap().jobs[0].clone();
        let attempt = store.jobs.claim(job.id).await.unwrap().unwrap();
        store
            .jobs
            .complete(job.id, attempt, JobStatus::Failed, None)
            .await
            .unwrap();
        controller.aggregator.reconcile(receipt.pipeline_id).await.unwrap();

        let err = controller.retry(job.id).await.unwrap_err();
        assert!(matches!(err, Error::Infrastructure(_)));

        let restored = store.jobs.get(job.id).await.unwrap();
        assert_eq!(restored.status, JobStatus::Failed);
        assert!(restored.logs.starts_with("Failed to dispatch retry"));
        let pipeline = store.pipelines.get(receipt.pipeline_id).await.unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Failed);

        let retried = controller.retry(job.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert!(retried.logs.is_empty());
        // the original dispatch plus the successful retry
        assert_eq!(queue.inner.len().await, 2);
    }

    #[tokio::test]
    async fn test_trigger_dispatch_failure_cancels_pipeline() {
        let store = Store::memory();
        let queue = Arc::new(FailingQueue::after(1));
        let controller = failing_controller(&store, three_steps(), queue);
        let repo = controller
            .create_repository("app", "https://git.example.com/app.git", None)
            .await
            .unwrap();

        let err = controller
            .trigger(repo.id, TriggerRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Infrastructure(_)));

        let pipelines = controller.pipelines(PipelineQuery::default()).await.unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].status, PipelineStatus::Cancelled);
        let jobs = store.jobs.list_by_pipeline(pipelines[0].id).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == JobStatus::Cancelled));
    }
}
