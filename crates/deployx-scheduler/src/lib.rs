//! Pipeline orchestration for DeployX.
//!
//! Turns triggers into pipelines with ordered jobs, dispatches the jobs to a
//! bounded worker pool through a PostgreSQL (SKIP LOCKED) or in-memory queue,
//! rolls job outcomes up into a pipeline verdict and tails job logs.

pub mod aggregator;
pub mod controller;
pub mod engine;
pub mod error;
pub mod logstream;
pub mod queue;
pub mod webhook;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::StatusAggregator;
pub use controller::{
    PipelineController, PipelineDetail, PipelineQuery, RepositoryDetail, TriggerReceipt,
    TriggerRequest,
};
pub use engine::{Disposition, ExecutionEngine};
pub use error::{QueueError, QueueResult};
pub use logstream::{LogEvent, LogStart, LogStreamService};
pub use queue::{Delivery, DispatchQueue, JobPayload, MemoryQueue, PgDispatchQueue};
pub use webhook::{WebhookGate, WebhookOutcome, WebhookRequest};
pub use worker::{Worker, WorkerPool};
