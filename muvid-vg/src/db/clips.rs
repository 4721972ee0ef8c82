//! Clip persistence and claim operations
//!
//! All generation-state transitions are compare-and-set on `status` so
//! that concurrent workers never hold the same clip: the claim succeeds
//! for exactly one caller, everyone else observes rows_affected = 0 and
//! drops the job.

use crate::models::{Clip, ClipStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn row_to_clip(row: &sqlx::sqlite::SqliteRow) -> Result<Clip> {
    let id: String = row.get("id");
    let song_id: String = row.get("song_id");
    let status: String = row.get("status");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    Ok(Clip {
        id: Uuid::parse_str(&id).context("invalid clip id")?,
        song_id: Uuid::parse_str(&song_id).context("invalid song id")?,
        plan_index: row.get("plan_index"),
        prompt: row.get("prompt"),
        seed: row.get("seed"),
        requested_frames: row.get("requested_frames"),
        requested_fps: row.get("requested_fps"),
        status: ClipStatus::parse(&status).unwrap_or(ClipStatus::Failed),
        external_job_id: row.get("external_job_id"),
        result_url: row.get("result_url"),
        result_width: row.get("result_width"),
        result_height: row.get("result_height"),
        result_fps: row.get("result_fps"),
        error: row.get("error"),
        attempt_count: row.get("attempt_count"),
        created_at,
        updated_at,
    })
}

/// Insert clips inside an open transaction
pub async fn insert_clips(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    clips: &[Clip],
) -> Result<()> {
    for clip in clips {
        sqlx::query(
            r#"
            INSERT INTO clips (
                id, song_id, plan_index, prompt, seed,
                requested_frames, requested_fps, status,
                external_job_id, result_url, result_width, result_height,
                result_fps, error, attempt_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(clip.id.to_string())
        .bind(clip.song_id.to_string())
        .bind(clip.plan_index)
        .bind(&clip.prompt)
        .bind(clip.seed)
        .bind(clip.requested_frames)
        .bind(clip.requested_fps)
        .bind(clip.status.as_str())
        .bind(&clip.external_job_id)
        .bind(&clip.result_url)
        .bind(clip.result_width)
        .bind(clip.result_height)
        .bind(clip.result_fps)
        .bind(&clip.error)
        .bind(clip.attempt_count)
        .bind(clip.created_at)
        .bind(clip.updated_at)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

/// Delete all clips for a song except the given ids, inside a transaction
///
/// Used by plan replacement: completed clips whose bounds match the new
/// plan survive, everything else is superseded.
pub async fn delete_for_song_except(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    song_id: Uuid,
    keep: &[Uuid],
) -> Result<u64> {
    // Dynamic IN list; clip counts are small (tens at most)
    let mut sql = String::from("DELETE FROM clips WHERE song_id = ?");
    if !keep.is_empty() {
        sql.push_str(" AND id NOT IN (");
        sql.push_str(&vec!["?"; keep.len()].join(", "));
        sql.push(')');
    }

    let mut query = sqlx::query(&sql).bind(song_id.to_string());
    for id in keep {
        query = query.bind(id.to_string());
    }

    let result = query.execute(&mut **tx).await?;
    Ok(result.rows_affected())
}

/// Load clip by id
pub async fn get_clip(pool: &SqlitePool, clip_id: Uuid) -> Result<Option<Clip>> {
    let row = sqlx::query("SELECT * FROM clips WHERE id = ?")
        .bind(clip_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_clip).transpose()
}

/// Ordered clips for a song
pub async fn clips_for_song(pool: &SqlitePool, song_id: Uuid) -> Result<Vec<Clip>> {
    let rows = sqlx::query("SELECT * FROM clips WHERE song_id = ? ORDER BY plan_index ASC")
        .bind(song_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_clip).collect()
}

/// Claim a clip for generation: queued -> processing, attempt + 1
///
/// Returns false when the clip was not queued (someone else holds it, or
/// it reached a terminal state); the caller must then drop the job.
pub async fn claim_for_processing(pool: &SqlitePool, clip_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE clips SET status = 'processing', attempt_count = attempt_count + 1,
         updated_at = ? WHERE id = ? AND status = 'queued'",
    )
    .bind(Utc::now())
    .bind(clip_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Release a claimed clip back to queued, undoing the attempt increment
///
/// Used when the per-song concurrency cap is full: the release is not a
/// generation attempt.
pub async fn release_to_queued(pool: &SqlitePool, clip_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE clips SET status = 'queued', attempt_count = attempt_count - 1,
         updated_at = ? WHERE id = ? AND status = 'processing'",
    )
    .bind(Utc::now())
    .bind(clip_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Requeue a processing clip for a later retry attempt (backoff path)
///
/// Clears the provider job id: the next attempt submits fresh under a
/// new (clip_id, attempt) idempotency key.
pub async fn requeue_for_retry(pool: &SqlitePool, clip_id: Uuid, error: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE clips SET status = 'queued', external_job_id = NULL, error = ?, updated_at = ?
         WHERE id = ? AND status = 'processing'",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(clip_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Number of clips currently generating for a song
pub async fn count_processing_for_song(pool: &SqlitePool, song_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM clips WHERE song_id = ? AND status = 'processing'",
    )
    .bind(song_id.to_string())
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Store the provider-side job id before polling begins
pub async fn set_external_job(
    pool: &SqlitePool,
    clip_id: Uuid,
    external_job_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE clips SET external_job_id = ?, updated_at = ? WHERE id = ?")
        .bind(external_job_id)
        .bind(Utc::now())
        .bind(clip_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Mark a processing clip completed with its verified result
pub async fn mark_completed(
    pool: &SqlitePool,
    clip_id: Uuid,
    result_url: &str,
    width: Option<i64>,
    height: Option<i64>,
    fps: Option<f64>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE clips SET status = 'completed', result_url = ?, result_width = ?,
         result_height = ?, result_fps = ?, error = NULL, updated_at = ?
         WHERE id = ? AND status = 'processing'",
    )
    .bind(result_url)
    .bind(width)
    .bind(height)
    .bind(fps)
    .bind(Utc::now())
    .bind(clip_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Mark a processing clip failed with the surfaced error message
pub async fn mark_failed(pool: &SqlitePool, clip_id: Uuid, error: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE clips SET status = 'failed', error = ?, updated_at = ?
         WHERE id = ? AND status = 'processing'",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(clip_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Mark a clip canceled from any non-terminal state
pub async fn mark_canceled(pool: &SqlitePool, clip_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE clips SET status = 'canceled', updated_at = ?
         WHERE id = ? AND status IN ('queued', 'processing')",
    )
    .bind(Utc::now())
    .bind(clip_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Cancel every queued clip for a song; returns how many flipped
pub async fn cancel_queued_for_song(pool: &SqlitePool, song_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE clips SET status = 'canceled', updated_at = ?
         WHERE song_id = ? AND status = 'queued'",
    )
    .bind(Utc::now())
    .bind(song_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Reset a failed or canceled clip to queued and clear its error
///
/// A subsequent completion is indistinguishable from a first-time one.
pub async fn reset_for_retry(pool: &SqlitePool, clip_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE clips SET status = 'queued', external_job_id = NULL, error = NULL, updated_at = ?
         WHERE id = ? AND status IN ('failed', 'canceled')",
    )
    .bind(Utc::now())
    .bind(clip_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Per-status clip counts for a song
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClipStatusCounts {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub canceled: i64,
    pub total: i64,
}

/// Aggregate clip counts by status
pub async fn status_counts(pool: &SqlitePool, song_id: Uuid) -> Result<ClipStatusCounts> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM clips WHERE song_id = ? GROUP BY status")
        .bind(song_id.to_string())
        .fetch_all(pool)
        .await?;

    let mut counts = ClipStatusCounts::default();
    for row in rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        counts.total += n;
        match status.as_str() {
            "queued" => counts.queued = n,
            "processing" => counts.processing = n,
            "completed" => counts.completed = n,
            "failed" => counts.failed = n,
            "canceled" => counts.canceled = n,
            _ => {}
        }
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::Song;

    async fn seeded_clip(pool: &SqlitePool) -> Clip {
        let song = Song::new("k".to_string(), None);
        crate::db::songs::insert_song(pool, &song).await.unwrap();
        let clip = Clip::new(song.id, 0, "prompt".into(), 7, 120, 24);
        let mut tx = pool.begin().await.unwrap();
        insert_clips(&mut tx, std::slice::from_ref(&clip)).await.unwrap();
        tx.commit().await.unwrap();
        clip
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let pool = test_pool().await;
        let clip = seeded_clip(&pool).await;

        assert!(claim_for_processing(&pool, clip.id).await.unwrap());
        // Second claim must observe the CAS failure
        assert!(!claim_for_processing(&pool, clip.id).await.unwrap());

        let loaded = get_clip(&pool, clip.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ClipStatus::Processing);
        assert_eq!(loaded.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_release_undoes_attempt() {
        let pool = test_pool().await;
        let clip = seeded_clip(&pool).await;

        claim_for_processing(&pool, clip.id).await.unwrap();
        assert!(release_to_queued(&pool, clip.id).await.unwrap());

        let loaded = get_clip(&pool, clip.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ClipStatus::Queued);
        assert_eq!(loaded.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_retry_resets_status_and_clears_error() {
        let pool = test_pool().await;
        let clip = seeded_clip(&pool).await;

        claim_for_processing(&pool, clip.id).await.unwrap();
        mark_failed(&pool, clip.id, "provider exploded").await.unwrap();

        assert!(reset_for_retry(&pool, clip.id).await.unwrap());
        let loaded = get_clip(&pool, clip.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ClipStatus::Queued);
        assert!(loaded.error.is_none());
        // Attempt history survives the reset
        assert_eq!(loaded.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_completed_clip_cannot_be_retried() {
        let pool = test_pool().await;
        let clip = seeded_clip(&pool).await;

        claim_for_processing(&pool, clip.id).await.unwrap();
        mark_completed(&pool, clip.id, "https://cdn/x.mp4", Some(1920), Some(1080), Some(24.0))
            .await
            .unwrap();

        assert!(!reset_for_retry(&pool, clip.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_counts() {
        let pool = test_pool().await;
        let song = Song::new("k".to_string(), None);
        crate::db::songs::insert_song(&pool, &song).await.unwrap();

        let clips: Vec<Clip> = (0..4)
            .map(|i| Clip::new(song.id, i, "p".into(), 1, 96, 24))
            .collect();
        let mut tx = pool.begin().await.unwrap();
        insert_clips(&mut tx, &clips).await.unwrap();
        tx.commit().await.unwrap();

        claim_for_processing(&pool, clips[0].id).await.unwrap();
        mark_completed(&pool, clips[0].id, "u", None, None, None)
            .await
            .unwrap();
        claim_for_processing(&pool, clips[1].id).await.unwrap();

        let counts = status_counts(&pool, song.id).await.unwrap();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.queued, 2);
    }
}
