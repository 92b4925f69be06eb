//! DeployX API server

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use deployx_api::{AppState, routes};
use deployx_config::{FileManifestSource, SystemConfig, load_system_config};
use deployx_db::{Store, create_pool, run_migrations};
use deployx_executor::{GitMaterializer, build_executor};
use deployx_scheduler::{
    DispatchQueue, ExecutionEngine, MemoryQueue, PgDispatchQueue, WorkerPool,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long in-flight jobs get to finish on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "deployx-server")]
#[command(about = "DeployX pipeline server", long_about = None)]
#[command(version)]
struct Args {
    /// System configuration file (KDL)
    #[arg(long, env = "DEPLOYX_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(long, env = "DEPLOYX_BIND")]
    bind: Option<String>,

    /// PostgreSQL connection string, overrides the config file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Keep all state in memory instead of PostgreSQL
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => load_system_config(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SystemConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if args.database_url.is_some() {
        config.database_url = args.database_url;
    }

    let (store, queue, pool) = if args.in_memory {
        warn!("Running with in-memory state; nothing survives a restart");
        let queue: Arc<dyn DispatchQueue> = Arc::new(MemoryQueue::new());
        (Store::memory(), queue, None)
    } else {
        let database_url = config
            .database_url
            .as_deref()
            .context("no database URL configured; set DATABASE_URL or pass --in-memory")?;
        info!("Connecting to database...");
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        info!("Database connected");

        // a claim older than the job timeout belongs to a dead worker
        let visibility = config.engine.job_timeout + Duration::from_secs(60);
        let queue: Arc<dyn DispatchQueue> =
            Arc::new(PgDispatchQueue::new(pool.clone(), visibility));
        (Store::postgres(pool.clone()), queue, Some(pool))
    };

    let executor = build_executor(&config.executor)?;
    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        executor,
        Arc::new(GitMaterializer::new()),
        config.engine.clone(),
    ));
    let workers = WorkerPool::spawn(engine, queue.clone());

    let manifests = Arc::new(FileManifestSource::new(config.manifest_path.clone()));
    let mut state = AppState::new(store, manifests, queue, config.logs.poll_interval);
    if let Some(pool) = pool {
        state = state.with_pool(pool);
    }

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!(
        bind = %config.server.bind,
        workers = workers.size(),
        manifest = %config.manifest_path.display(),
        "Starting server"
    );
    let listener = TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draining workers");
    workers.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
