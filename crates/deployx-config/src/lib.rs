//! KDL configuration parsing for DeployX.
//!
//! This crate handles parsing of:
//! - Pipeline manifests (.deployx.kdl)
//! - System configuration (deployx.kdl)

pub mod error;
pub mod manifest;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use manifest::{DEFAULT_MANIFEST, FileManifestSource, parse_manifest};
pub use system::{
    EngineConfig, ExecutorConfig, LogStreamConfig, ServerConfig, SystemConfig,
    load_system_config, parse_system_config,
};
