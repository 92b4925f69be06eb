//! DeployX CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod client;
mod commands;
mod sse;

use client::ApiClient;

#[derive(Parser)]
#[command(name = "deployx")]
#[command(about = "DeployX pipeline CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// API server URL
    #[arg(long, env = "DEPLOYX_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage repositories
    Repos {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// Trigger and inspect pipelines
    Pipelines {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Inspect and retry jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Validate a pipeline manifest
    Validate {
        /// Path to the manifest file
        #[arg(default_value = deployx_config::DEFAULT_MANIFEST)]
        path: String,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Register a repository
    Add {
        name: String,
        /// Clone URL
        url: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List repositories
    List,
    /// Show a repository with pipeline counts
    Show { id: String },
    /// Delete a repository and its pipelines
    Delete { id: String },
}

#[derive(Subcommand)]
enum PipelineCommands {
    /// Trigger a pipeline for a repository
    Trigger {
        /// Repository ID
        repository: String,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        commit: Option<String>,
    },
    /// List recent pipelines, newest first
    List {
        /// Filter by repository ID
        #[arg(long)]
        repository: Option<String>,
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Maximum number of pipelines to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Show a pipeline and its jobs
    Show { id: String },
    /// Cancel a pipeline
    Cancel { id: String },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Show job details and output
    Show { id: String },
    /// Retry a failed job
    Retry { id: String },
    /// Print job output
    Logs {
        id: String,
        /// Stream output until the job finishes
        #[arg(short, long)]
        follow: bool,
        /// With --follow, skip output produced so far
        #[arg(long, requires = "follow")]
        tail: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Validate { path } = &cli.command {
        return commands::validate(path);
    }
    let client = ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Repos { command } => match command {
            RepoCommands::Add {
                name,
                url,
                description,
            } => commands::repos::add(&client, &name, &url, description).await?,
            RepoCommands::List => commands::repos::list(&client).await?,
            RepoCommands::Show { id } => commands::repos::show(&client, &id).await?,
            RepoCommands::Delete { id } => commands::repos::delete(&client, &id).await?,
        },
        Commands::Pipelines { command } => match command {
            PipelineCommands::Trigger {
                repository,
                branch,
                commit,
            } => commands::pipelines::trigger(&client, &repository, branch, commit).await?,
            PipelineCommands::List {
                repository,
                status,
                limit,
            } => commands::pipelines::list(&client, repository, status, limit).await?,
            PipelineCommands::Show { id } => commands::pipelines::show(&client, &id).await?,
            PipelineCommands::Cancel { id } => commands::pipelines::cancel(&client, &id).await?,
        },
        Commands::Jobs { command } => match command {
            JobCommands::Show { id } => commands::jobs::show(&client, &id).await?,
            JobCommands::Retry { id } => commands::jobs::retry(&client, &id).await?,
            JobCommands::Logs { id, follow, tail } => {
                commands::jobs::logs(&client, &id, follow, tail).await?
            }
        },
        Commands::Validate { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_logs_follow() {
        let cli = Cli::try_parse_from(["deployx", "jobs", "logs", "abc", "--follow", "--tail"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Jobs {
                command: JobCommands::Logs {
                    follow: true,
                    tail: true,
                    ..
                }
            }
        ));
        assert!(Cli::try_parse_from(["deployx", "jobs", "logs", "abc", "--tail"]).is_err());
    }
}
