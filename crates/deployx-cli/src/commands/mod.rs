//! CLI command implementations.

pub mod jobs;
pub mod pipelines;
pub mod repos;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deployx_config::parse_manifest;

pub fn validate(path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path))?;
    match parse_manifest(&content) {
        Ok(steps) => {
            println!("Manifest is valid ({} steps)", steps.len());
            for (position, step) in steps.iter().enumerate() {
                println!("  {}. {}: {}", position + 1, step.name, step.command);
            }
            Ok(())
        }
        Err(e) => {
            println!("Manifest error: {}", e);
            std::process::exit(1);
        }
    }
}

pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// First eight characters of an id or commit, enough to tell rows apart.
pub(crate) fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
