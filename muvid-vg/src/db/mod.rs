//! Database access for muvid-vg
//!
//! The record store is the single source of truth; workers coordinate
//! through row-level claims (compare-and-set on status columns).

pub mod analyses;
pub mod clips;
pub mod composed_videos;
pub mod compositions;
pub mod jobs;
pub mod plans;
pub mod schema;
pub mod songs;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
///
/// Connects to the service database inside the root folder, creating it
/// (and the schema) on first run.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    schema::initialize_schema(&pool).await?;

    Ok(pool)
}

/// In-memory pool for tests
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("in-memory database");
    schema::initialize_schema(&pool)
        .await
        .expect("schema init");
    pool
}
