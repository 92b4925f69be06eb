//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("manifest defines no steps")]
    EmptyManifest,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for deployx_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                deployx_core::Error::Validation(format!("pipeline manifest not found: {}", e))
            }
            ConfigError::Io(e) => deployx_core::Error::Infrastructure(e.to_string()),
            other => deployx_core::Error::Validation(other.to_string()),
        }
    }
}
