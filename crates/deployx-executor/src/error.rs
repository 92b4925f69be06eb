use thiserror::Error;

/// Errors raised while preparing a workspace or running a command.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Git {operation} failed: {stderr}")]
    Git { operation: &'static str, stderr: String },

    #[error("Invalid repository URL: {0}")]
    InvalidUrl(String),
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

impl From<ExecutorError> for deployx_core::Error {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Docker(e) => deployx_core::Error::Infrastructure(e.to_string()),
            other => deployx_core::Error::Execution(other.to_string()),
        }
    }
}
