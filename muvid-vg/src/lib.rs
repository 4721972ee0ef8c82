//! muvid-vg - Music video generation service
//!
//! Backend orchestration core: analyzes uploaded audio (beats, tempo,
//! sections, mood, lyrics), plans beat-aligned clip boundaries with
//! per-clip visual prompts, drives an external text/image-to-video
//! generator with bounded concurrency and at-most-once semantics, and
//! composes the results into the final MP4 with beat-synchronous
//! transitions and audio-reactive effects.
//!
//! The HTTP surface never blocks on CPU or slow I/O; long work runs on
//! DB-backed named FIFO queues consumed by worker tasks.

pub mod analysis;
pub mod api;
pub mod clips;
pub mod compose;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod planning;
pub mod queue;
pub mod storage;

pub use crate::error::{ApiError, ApiResult};

use crate::clips::generator_client::{DynVideoGenerator, HttpVideoGenerator};
use crate::config::AppConfig;
use crate::queue::{CancellationRegistry, WorkerContext};
use crate::storage::BlobStore;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use muvid_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Application state shared across handlers and workers
#[derive(Clone)]
pub struct AppState {
    /// Record store pool; the single source of truth
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Immutable configuration snapshot
    pub config: Arc<AppConfig>,
    /// Blob store adapter
    pub blobs: Arc<BlobStore>,
    /// External generator client; absent when unconfigured
    pub generator: Option<DynVideoGenerator>,
    /// In-process cancellation tokens per job
    pub cancellations: CancellationRegistry,
    /// Service startup timestamp for uptime reporting
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        config: Arc<AppConfig>,
        blobs: Arc<BlobStore>,
        generator: Option<DynVideoGenerator>,
    ) -> Self {
        Self {
            db,
            event_bus,
            config,
            blobs,
            generator,
            cancellations: CancellationRegistry::new(),
            startup_time: Utc::now(),
        }
    }

    /// Build state from a loaded config (opens pool, blob store, clients)
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let db = db::init_database_pool(&config.database_path()).await?;
        let event_bus = EventBus::new(1000);

        let token_secret = config
            .blob_token_secret
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let blobs = Arc::new(BlobStore::new(config.blob_root(), token_secret)?);

        let generator: Option<DynVideoGenerator> = match config.services.generator.clone() {
            Some(endpoint) => Some(Arc::new(HttpVideoGenerator::new(endpoint)?)),
            None => {
                tracing::warn!("No video generator endpoint configured; clip generation will fail");
                None
            }
        };

        Ok(Self::new(db, event_bus, Arc::new(config), blobs, generator))
    }

    /// The context handed to queue workers
    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            db: self.db.clone(),
            event_bus: self.event_bus.clone(),
            config: Arc::clone(&self.config),
            blobs: Arc::clone(&self.blobs),
            generator: self.generator.clone(),
            cancellations: self.cancellations.clone(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::song_routes())
        .merge(api::analysis_routes())
        .merge(api::clip_routes())
        .merge(api::compose_routes())
        .merge(api::job_routes())
        .merge(api::blob_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .with_state(state)
}

/// Spawn the worker pool plus the reaper and blob sweeper
///
/// Returns the join handles; callers cancel `shutdown` to stop them.
pub fn spawn_workers(
    state: &AppState,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    for worker_id in 0..state.config.workers.count.max(1) {
        let ctx = state.worker_context();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            queue::worker::run_worker(ctx, worker_id, shutdown).await;
        }));
    }

    let ctx = state.worker_context();
    let reaper_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        queue::worker::run_reaper(ctx, reaper_shutdown).await;
    }));

    let ctx = state.worker_context();
    handles.push(tokio::spawn(async move {
        queue::worker::run_blob_sweeper(ctx, shutdown).await;
    }));

    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_app_state_and_router_build() {
        let pool = db::test_pool().await;
        let event_bus = EventBus::new(10);
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path().to_path_buf(), "s".into()).unwrap());
        let state = AppState::new(
            pool,
            event_bus,
            Arc::new(AppConfig::default()),
            blobs,
            None,
        );
        let _router = build_router(state);
    }
}
