//! Repository traits and implementations.

pub mod job;
pub mod pipeline;
pub mod repository;
pub mod webhook;

pub use job::{JobRepo, PgJobRepo};
pub use pipeline::{NewPipeline, PgPipelineRepo, PipelineFilter, PipelineRepo};
pub use repository::{PgRepositoryRepo, RepositoryRepo, RepositoryUpdate};
pub use webhook::{PgWebhookRepo, WebhookRepo};
