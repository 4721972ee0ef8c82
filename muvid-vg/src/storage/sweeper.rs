//! Blob garbage collection
//!
//! The record store is authoritative: any blob whose key is not referenced
//! by a songs or composed_videos row (and is older than a grace period,
//! to spare in-flight uploads) is deleted. Runs periodically from the
//! service main loop.

use super::BlobStore;
use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// Grace period before an unreferenced blob is eligible for deletion
const ORPHAN_GRACE: Duration = Duration::from_secs(3600);

/// Delete blobs with no owning record row
///
/// Returns the number of files removed.
pub async fn sweep_orphans(pool: &SqlitePool, store: &BlobStore) -> Result<u64> {
    sweep_with_grace(pool, store, ORPHAN_GRACE).await
}

async fn sweep_with_grace(
    pool: &SqlitePool,
    store: &BlobStore,
    grace: Duration,
) -> Result<u64> {
    let referenced = referenced_keys(pool).await?;

    let mut removed = 0u64;
    let root = store.root().to_path_buf();

    for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&root) else {
            continue;
        };
        let key = relative.to_string_lossy().replace('\\', "/");

        if referenced.contains(key.as_str()) {
            continue;
        }

        // Spare files younger than the grace period; a missing mtime is
        // treated as young.
        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|m| SystemTime::now().duration_since(m).ok());
        if age.map(|a| a < grace).unwrap_or(true) && !grace.is_zero() {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                tracing::info!(key = %key, "Swept orphaned blob");
                removed += 1;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to sweep orphaned blob");
            }
        }
    }

    Ok(removed)
}

async fn referenced_keys(pool: &SqlitePool) -> Result<HashSet<String>> {
    let mut keys = HashSet::new();

    let rows = sqlx::query("SELECT source_blob_key, character_image_key FROM songs")
        .fetch_all(pool)
        .await?;
    for row in rows {
        let source: String = row.get("source_blob_key");
        keys.insert(source);
        let character: Option<String> = row.get("character_image_key");
        if let Some(character) = character {
            keys.insert(character);
        }
    }

    let rows = sqlx::query("SELECT blob_key FROM composed_videos")
        .fetch_all(pool)
        .await?;
    for row in rows {
        let key: String = row.get("blob_key");
        keys.insert(key);
    }

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::Song;

    #[tokio::test]
    async fn test_referenced_blob_survives_sweep() {
        let pool = test_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf(), "s".into()).unwrap();

        let song = Song::new("songs/a/source.mp3".to_string(), None);
        crate::db::songs::insert_song(&pool, &song).await.unwrap();
        store.put("songs/a/source.mp3", b"audio").await.unwrap();
        store.put("composed/orphan.mp4", b"video").await.unwrap();

        // Zero grace so the orphan is eligible immediately
        let removed = sweep_with_grace(&pool, &store, Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.exists("songs/a/source.mp3").await);
        assert!(!store.exists("composed/orphan.mp4").await);
    }

    #[tokio::test]
    async fn test_fresh_orphan_spared_by_grace_period() {
        let pool = test_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf(), "s".into()).unwrap();

        store.put("composed/orphan.mp4", b"video").await.unwrap();

        let removed = sweep_orphans(&pool, &store).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.exists("composed/orphan.mp4").await);
    }
}
