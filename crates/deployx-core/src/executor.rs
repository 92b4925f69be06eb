//! Executor and materializer traits.
//!
//! Executors run one job command inside a prepared workspace and stream its
//! output back as it is produced. Materializers prepare that workspace from
//! the repository source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::{JobId, PipelineId, Result};

/// Receives output chunks (usually whole lines) while a command runs.
pub type OutputSink = mpsc::Sender<String>;

/// A command to execute for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    /// Shell command line, run via `sh -c`.
    pub command: String,
    /// Host directory holding the materialized repository.
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
}

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Exit code, or `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trait for job executors.
///
/// Dropping the future returned by [`CommandExecutor::run`] must stop the
/// underlying process or container.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run a command to completion, sending output to `output` as it arrives.
    async fn run(&self, request: ExecRequest, output: OutputSink) -> Result<ExecOutcome>;
}

/// Where to fetch a pipeline's source from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    pub branch: Option<String>,
    pub commit_id: Option<String>,
}

/// Prepares a workspace directory with the repository contents.
#[async_trait]
pub trait Materializer: Send + Sync {
    /// Clone into `workspace` if absent, otherwise update it in place.
    async fn materialize(&self, source: &SourceSpec, workspace: &Path) -> Result<()>;
}
