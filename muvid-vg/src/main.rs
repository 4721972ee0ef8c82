//! muvid-vg - Music video generation service
//!
//! Serves the HTTP API and runs the queue worker pool in one process.
//! Multiple processes may share the same root folder; the record store
//! claims keep them from stepping on each other.

use anyhow::Result;
use clap::Parser;
use muvid_vg::config::AppConfig;
use muvid_vg::{build_router, spawn_workers, AppState};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "muvid-vg", about = "Music video generation service")]
struct Args {
    /// Root folder for the database and blob store
    #[arg(long, env = "MUVID_ROOT")]
    root_folder: Option<PathBuf>,

    /// HTTP listen port (overrides config)
    #[arg(long, env = "MUVID_PORT")]
    port: Option<u16>,

    /// Run without the embedded worker pool (API only)
    #[arg(long, default_value_t = false)]
    no_workers: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load(args.root_folder);
    if let Some(port) = args.port {
        config.port = port;
    }

    info!("Starting muvid-vg (music video generation) service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Root folder: {}", config.root_folder.display());
    info!("Database: {}", config.database_path().display());
    info!(
        "Queues: {} / {}",
        config.clip_queue(),
        config.default_queue()
    );

    let port = config.port;
    let state = AppState::from_config(config).await?;

    let shutdown = CancellationToken::new();
    let worker_handles = if args.no_workers {
        info!("Worker pool disabled (--no-workers)");
        Vec::new()
    } else {
        let handles = spawn_workers(&state, shutdown.clone());
        info!(workers = state.config.workers.count, "Worker pool started");
        handles
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!("Listening on http://127.0.0.1:{port}");
    info!("Health check: http://127.0.0.1:{port}/health");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("muvid-vg stopped");

    Ok(())
}
