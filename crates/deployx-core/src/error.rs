//! Error types for DeployX.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A repository, pipeline, job or webhook does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request is well-formed but not allowed in the current state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Webhook signature or token did not match the configured secret.
    #[error("invalid signature: {0}")]
    Signature(String),

    /// A job command failed or timed out.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The store, queue or another backing service is unavailable.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

pub type Result<T> = std::result::Result<T, Error>;
