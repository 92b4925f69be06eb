//! Step manifest source.

use async_trait::async_trait;

use crate::pipeline::Step;
use crate::repository::Repository;
use crate::{Error, Result};

/// Loads the ordered step list a pipeline should run.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn load(
        &self,
        repository: &Repository,
        branch: &str,
        commit_id: Option<&str>,
    ) -> Result<Vec<Step>>;
}

/// A fixed manifest, shared by every repository.
#[derive(Debug, Clone, Default)]
pub struct StaticManifest {
    steps: Vec<Step>,
}

impl StaticManifest {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl ManifestSource for StaticManifest {
    async fn load(
        &self,
        _repository: &Repository,
        _branch: &str,
        _commit_id: Option<&str>,
    ) -> Result<Vec<Step>> {
        Ok(self.steps.clone())
    }
}

/// Reject manifests that cannot produce a runnable pipeline.
pub fn validate_steps(steps: &[Step]) -> Result<()> {
    if steps.is_empty() {
        return Err(Error::Validation(
            "pipeline manifest contains no steps".to_string(),
        ));
    }

    for (idx, step) in steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(Error::Validation(format!("step {} has no name", idx + 1)));
        }
        if step.command.trim().is_empty() {
            return Err(Error::Validation(format!(
                "step '{}' has no command",
                step.name
            )));
        }
    }

    Ok(())
}
