//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Turn a unique-constraint violation into [`DbError::Duplicate`].
    pub(crate) fn from_insert(err: sqlx::Error, what: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(what.into())
            }
            _ => DbError::Database(err),
        }
    }
}

impl From<DbError> for deployx_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => deployx_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => {
                deployx_core::Error::Validation(format!("already exists: {}", msg))
            }
            DbError::Conflict(msg) => deployx_core::Error::Validation(msg),
            _ => deployx_core::Error::Infrastructure(err.to_string()),
        }
    }
}
