//! Dispatch queue errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed queue payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("unknown delivery {0}")]
    UnknownDelivery(uuid::Uuid),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

impl From<QueueError> for deployx_core::Error {
    fn from(err: QueueError) -> Self {
        deployx_core::Error::Infrastructure(err.to_string())
    }
}
