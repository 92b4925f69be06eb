//! Job execution engine.
//!
//! Runs one dispatched job end to end: pickup guard, sequential gate,
//! workspace materialization, conditional claim, command execution with log
//! capture, terminal write and pipeline reconcile.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use deployx_config::EngineConfig;
use deployx_core::executor::{
    CommandExecutor, ExecOutcome, ExecRequest, Materializer, SourceSpec,
};
use deployx_core::{Job, JobStatus, Result};
use deployx_db::{DbError, Store};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::StatusAggregator;
use crate::queue::JobPayload;

/// What the worker should do with the delivery after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The delivery is finished with; ack it.
    Done,
    /// Another step of the same pipeline has to go first; deliver again later.
    Requeue,
}

enum RunEnd {
    Finished(Result<ExecOutcome>),
    TimedOut,
    /// The job stopped belonging to this attempt (cancelled or reset).
    Abandoned,
}

pub struct ExecutionEngine {
    store: Store,
    executor: Arc<dyn CommandExecutor>,
    materializer: Arc<dyn Materializer>,
    aggregator: StatusAggregator,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        store: Store,
        executor: Arc<dyn CommandExecutor>,
        materializer: Arc<dyn Materializer>,
        config: EngineConfig,
    ) -> Self {
        let aggregator = StatusAggregator::new(store.pipelines.clone(), store.jobs.clone());
        Self {
            store,
            executor,
            materializer,
            aggregator,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Workspace shared by every job of a pipeline.
    pub fn workspace_for(&self, payload: &JobPayload) -> PathBuf {
        self.config
            .workspace_root
            .join(payload.pipeline_id.to_string())
    }

    pub async fn process(&self, payload: &JobPayload) -> Result<Disposition> {
        let job = match self.store.jobs.get(payload.job_id).await {
            Ok(job) => job,
            Err(DbError::NotFound(_)) => {
                warn!(job_id = %payload.job_id, "Dispatched job no longer exists");
                return Ok(Disposition::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if job.status != JobStatus::Queued {
            debug!(job_id = %job.id, status = %job.status, "Skipping job that is not queued");
            return Ok(Disposition::Done);
        }

        if self.must_wait(&job).await? {
            debug!(job_id = %job.id, position = job.position, "Waiting for sibling steps");
            return Ok(Disposition::Requeue);
        }

        let workspace = self.workspace_for(payload);
        let source = SourceSpec {
            url: payload.repository_url.clone(),
            branch: Some(payload.branch.clone()),
            commit_id: payload.commit_id.clone(),
        };
        if let Err(e) = self.materializer.materialize(&source, &workspace).await {
            error!(job_id = %job.id, error = %e, "Failed to prepare workspace");
            let message = format!("Failed to prepare workspace: {}\n", e);
            self.store.jobs.fail_queued(job.id, &message).await?;
            self.aggregator.reconcile(job.pipeline_id).await?;
            return Ok(Disposition::Done);
        }

        let Some(attempt) = self.store.jobs.claim(job.id).await? else {
            let still_queued = matches!(
                self.store.jobs.get(job.id).await,
                Ok(current) if current.status == JobStatus::Queued
            );
            if still_queued {
                debug!(job_id = %job.id, "Sibling step started first");
                return Ok(Disposition::Requeue);
            }
            debug!(job_id = %job.id, "Job was claimed or cancelled by someone else");
            return Ok(Disposition::Done);
        };

        info!(
            job_id = %job.id,
            pipeline_id = %job.pipeline_id,
            step = %job.name,
            attempt,
            executor = self.executor.name(),
            "Running job"
        );

        let request = ExecRequest {
            job_id: job.id,
            pipeline_id: job.pipeline_id,
            command: payload.command.clone(),
            working_dir: workspace,
            env: job_env(payload),
        };

        match self.run(&job, attempt, request).await {
            RunEnd::Abandoned => {
                info!(job_id = %job.id, attempt, "Job no longer owned by this attempt, abandoned");
            }
            end => {
                let (status, trailer) = verdict(end, &self.config);
                let written = self
                    .store
                    .jobs
                    .complete(job.id, attempt, status, trailer.as_deref())
                    .await?;
                if written {
                    info!(job_id = %job.id, status = %status, "Job finished");
                } else {
                    debug!(job_id = %job.id, "Job changed underneath; result dropped");
                }
            }
        }

        self.aggregator.reconcile(job.pipeline_id).await?;
        Ok(Disposition::Done)
    }

    /// Steps share the pipeline workspace: a job waits while an earlier step
    /// is open or any other step is running. A retried step can sit behind a
    /// later one that is still running.
    async fn must_wait(&self, job: &Job) -> Result<bool> {
        let siblings = self.store.jobs.list_by_pipeline(job.pipeline_id).await?;
        Ok(siblings.iter().any(|s| {
            s.id != job.id
                && (s.status == JobStatus::Running
                    || (s.position < job.position && !s.status.is_terminal()))
        }))
    }

    /// Drive the executor until it finishes, times out, or the job is taken
    /// away from this attempt. Output is appended to the log as it arrives.
    async fn run(&self, job: &Job, attempt: i32, request: ExecRequest) -> RunEnd {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let mut execution = self.executor.run(request, tx);

        let deadline = tokio::time::sleep(self.config.job_timeout);
        tokio::pin!(deadline);
        let period = self.config.cancel_check_interval;
        let mut cancel_check = tokio::time::interval_at(Instant::now() + period, period);
        cancel_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                outcome = &mut execution => break RunEnd::Finished(outcome),
                Some(chunk) = rx.recv() => {
                    if !self.append(job, attempt, &chunk).await {
                        break RunEnd::Abandoned;
                    }
                }
                _ = &mut deadline => break RunEnd::TimedOut,
                _ = cancel_check.tick() => {
                    if !self.still_owned(job, attempt).await {
                        break RunEnd::Abandoned;
                    }
                }
            }
        };
        // stops the process or container
        drop(execution);

        if let RunEnd::Finished(_) = &end {
            while let Ok(chunk) = rx.try_recv() {
                if !self.append(job, attempt, &chunk).await {
                    return RunEnd::Abandoned;
                }
            }
        }
        end
    }

    /// Returns `false` once the job no longer belongs to `attempt`.
    async fn append(&self, job: &Job, attempt: i32, chunk: &str) -> bool {
        match self.store.jobs.append_log(job.id, attempt, chunk).await {
            Ok(owned) => owned,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to append job log");
                true
            }
        }
    }

    async fn still_owned(&self, job: &Job, attempt: i32) -> bool {
        match self.store.jobs.get(job.id).await {
            Ok(current) => current.status == JobStatus::Running && current.attempt == attempt,
            Err(DbError::NotFound(_)) => false,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to check job status");
                true
            }
        }
    }
}

fn verdict(end: RunEnd, config: &EngineConfig) -> (JobStatus, Option<String>) {
    match end {
        RunEnd::Finished(Ok(outcome)) if outcome.success() => (JobStatus::Success, None),
        RunEnd::Finished(Ok(outcome)) => {
            let reason = match outcome.exit_code {
                Some(code) => format!("Command exited with code {}\n", code),
                None => "Command was terminated by a signal\n".to_string(),
            };
            (JobStatus::Failed, Some(reason))
        }
        RunEnd::Finished(Err(e)) => (JobStatus::Failed, Some(format!("Execution error: {}\n", e))),
        RunEnd::TimedOut => (
            JobStatus::Failed,
            Some(format!(
                "Job timed out after {}s\n",
                config.job_timeout.as_secs()
            )),
        ),
        RunEnd::Abandoned => (JobStatus::Cancelled, None),
    }
}

fn job_env(payload: &JobPayload) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("CI".to_string(), "true".to_string());
    env.insert("DEPLOYX_JOB_ID".to_string(), payload.job_id.to_string());
    env.insert(
        "DEPLOYX_PIPELINE_ID".to_string(),
        payload.pipeline_id.to_string(),
    );
    env.insert("DEPLOYX_BRANCH".to_string(), payload.branch.clone());
    if let Some(commit) = &payload.commit_id {
        env.insert("DEPLOYX_COMMIT".to_string(), commit.clone());
    }
    env
}
