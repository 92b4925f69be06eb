//! HTTP API server for DeployX.
//!
//! REST endpoints for repositories, pipelines, jobs and webhooks, plus a
//! Server-Sent Events stream of job logs.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
