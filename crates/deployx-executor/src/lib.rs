//! Job execution backends for DeployX.
//!
//! - [`ProcessExecutor`] runs commands with the host shell
//! - [`DockerExecutor`] runs them in a throwaway container
//! - [`GitMaterializer`] prepares the workspace both of them run in

pub mod docker;
pub mod error;
pub mod git;
pub mod process;

use std::sync::Arc;

use deployx_config::ExecutorConfig;
use deployx_core::executor::CommandExecutor;
use tracing::info;

pub use docker::DockerExecutor;
pub use error::{ExecutorError, ExecutorResult};
pub use git::GitMaterializer;
pub use process::ProcessExecutor;

/// Build the executor selected by the system configuration.
pub fn build_executor(config: &ExecutorConfig) -> ExecutorResult<Arc<dyn CommandExecutor>> {
    let executor: Arc<dyn CommandExecutor> = match config {
        ExecutorConfig::Process => Arc::new(ProcessExecutor::new()),
        ExecutorConfig::Docker { image } => Arc::new(DockerExecutor::new(image.clone())?),
    };
    info!(executor = executor.name(), "Executor configured");
    Ok(executor)
}
