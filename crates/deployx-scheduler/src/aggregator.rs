//! Pipeline status rollup.

use std::sync::Arc;

use deployx_core::{PipelineId, Result, rollup};
use deployx_db::{JobRepo, PipelineRepo};
use tracing::{debug, info};

/// Derives a pipeline's terminal status from its jobs.
#[derive(Clone)]
pub struct StatusAggregator {
    pipelines: Arc<dyn PipelineRepo>,
    jobs: Arc<dyn JobRepo>,
}

impl StatusAggregator {
    pub fn new(pipelines: Arc<dyn PipelineRepo>, jobs: Arc<dyn JobRepo>) -> Self {
        Self { pipelines, jobs }
    }

    /// Finalize the pipeline if every job is terminal.
    ///
    /// Returns `true` only for the call that performed the transition; repeat
    /// calls, and calls while jobs are still open, return `false`.
    pub async fn reconcile(&self, pipeline_id: PipelineId) -> Result<bool> {
        let jobs = self.jobs.list_by_pipeline(pipeline_id).await?;
        let Some(verdict) = rollup(jobs.iter().map(|j| j.status)) else {
            debug!(pipeline_id = %pipeline_id, "Pipeline still has open jobs");
            return Ok(false);
        };

        let finalized = self.pipelines.finalize(pipeline_id, verdict).await?;
        if finalized {
            info!(pipeline_id = %pipeline_id, status = %verdict, "Pipeline finished");
        }
        Ok(finalized)
    }
}
