//! Worker runtime for the named job queues
//!
//! Workers are long-lived tasks that dequeue from named FIFO queues and
//! drive one job at a time. Cancellation is cooperative: an in-process
//! token gives prompt wakeups, the job row's status gives cross-process
//! visibility, and every job kind checks both at its checkpoints.

pub mod worker;

use crate::clips::generator_client::DynVideoGenerator;
use crate::config::AppConfig;
use crate::storage::BlobStore;
use muvid_common::events::EventBus;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// In-process cancellation tokens keyed by job id
///
/// Only an acceleration: the DB job status stays authoritative so cancel
/// requests reach workers in other processes too.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a job starting work
    pub async fn register(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.write().await.insert(job_id, token.clone());
        token
    }

    /// Trigger the in-process token for a job, if it runs here
    pub async fn cancel(&self, job_id: Uuid) {
        if let Some(token) = self.tokens.read().await.get(&job_id) {
            token.cancel();
        }
    }

    /// Drop a finished job's token
    pub async fn remove(&self, job_id: Uuid) {
        self.tokens.write().await.remove(&job_id);
    }
}

/// Everything a worker needs to run any job kind
#[derive(Clone)]
pub struct WorkerContext {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub config: Arc<AppConfig>,
    pub blobs: Arc<BlobStore>,
    /// Absent when no generator endpoint is configured; clip jobs then
    /// fail permanently with a clear message
    pub generator: Option<DynVideoGenerator>,
    pub cancellations: CancellationRegistry,
}

impl WorkerContext {
    /// Checkpoint probe: has this job been asked to stop?
    ///
    /// True when either the in-process token fired or the job row says
    /// canceling/canceled.
    pub async fn cancel_requested(&self, job_id: Uuid, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return true;
        }
        crate::db::jobs::is_canceling(&self.db, job_id)
            .await
            .unwrap_or(false)
    }
}
