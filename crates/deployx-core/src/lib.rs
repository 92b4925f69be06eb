//! Core domain types and traits for DeployX.
//!
//! This crate contains:
//! - Resource identifiers and the error taxonomy
//! - Pipeline, job, repository and webhook records
//! - The pipeline status rollup rule
//! - Executor, materializer and manifest traits

pub mod error;
pub mod executor;
pub mod id;
pub mod manifest;
pub mod pipeline;
pub mod repository;

pub use error::{Error, Result};
pub use id::{JobId, PipelineId, RepositoryId, WebhookId};
pub use pipeline::{Job, JobStatus, Pipeline, PipelineStatus, Step, rollup};
pub use repository::{Repository, RepositoryStats, Webhook, WebhookProvider};
