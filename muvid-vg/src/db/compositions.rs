//! Composition job persistence

use crate::models::{CompositionJob, CompositionState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<CompositionJob> {
    let id: String = row.get("id");
    let song_id: String = row.get("song_id");
    let clip_ids: String = row.get("clip_ids");
    let state: String = row.get("state");
    let cancel_requested: i64 = row.get("cancel_requested");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    let clip_ids: Vec<String> = serde_json::from_str(&clip_ids).context("clip_ids json")?;
    let clip_ids = clip_ids
        .iter()
        .map(|s| Uuid::parse_str(s).context("invalid clip id"))
        .collect::<Result<Vec<_>>>()?;

    Ok(CompositionJob {
        id: Uuid::parse_str(&id).context("invalid composition id")?,
        song_id: Uuid::parse_str(&song_id).context("invalid song id")?,
        clip_ids,
        state: CompositionState::parse(&state).unwrap_or(CompositionState::Failed),
        progress: row.get("progress"),
        error: row.get("error"),
        cancel_requested: cancel_requested != 0,
        created_at,
        updated_at,
    })
}

fn clip_ids_json(job: &CompositionJob) -> Result<String> {
    let ids: Vec<String> = job.clip_ids.iter().map(|id| id.to_string()).collect();
    Ok(serde_json::to_string(&ids)?)
}

/// Insert a new composition job
pub async fn insert_job(pool: &SqlitePool, job: &CompositionJob) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO composition_jobs (
            id, song_id, clip_ids, state, progress, error,
            cancel_requested, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id.to_string())
    .bind(job.song_id.to_string())
    .bind(clip_ids_json(job)?)
    .bind(job.state.as_str())
    .bind(job.progress)
    .bind(&job.error)
    .bind(job.cancel_requested as i64)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load composition job by id
pub async fn get_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<CompositionJob>> {
    let row = sqlx::query("SELECT * FROM composition_jobs WHERE id = ?")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// The non-terminal composition for a song, if one exists
///
/// At most one is allowed; enqueue checks this first.
pub async fn active_for_song(pool: &SqlitePool, song_id: Uuid) -> Result<Option<CompositionJob>> {
    let row = sqlx::query(
        "SELECT * FROM composition_jobs
         WHERE song_id = ? AND state NOT IN ('completed', 'failed', 'canceled')
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(song_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// Advance the pipeline state with its nominal progress
///
/// Progress never decreases: the stored value is kept when it already
/// exceeds the state's nominal percent.
pub async fn set_state(
    pool: &SqlitePool,
    job_id: Uuid,
    state: CompositionState,
) -> Result<()> {
    sqlx::query(
        "UPDATE composition_jobs SET state = ?, progress = MAX(progress, ?), updated_at = ?
         WHERE id = ?",
    )
    .bind(state.as_str())
    .bind(state.progress_percent())
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Update fine-grained progress within a state (e.g. per-clip
/// normalization)
pub async fn set_progress(pool: &SqlitePool, job_id: Uuid, progress: f64) -> Result<()> {
    sqlx::query(
        "UPDATE composition_jobs SET progress = MAX(progress, ?), updated_at = ? WHERE id = ?",
    )
    .bind(progress)
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Fail the job with a message
pub async fn mark_failed(pool: &SqlitePool, job_id: Uuid, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE composition_jobs SET state = 'failed', error = ?, updated_at = ? WHERE id = ?",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark the job canceled (reached a checkpoint after a cancel request)
pub async fn mark_canceled(pool: &SqlitePool, job_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE composition_jobs SET state = 'canceled', updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(job_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Request cancellation; workers honor it at the next checkpoint
pub async fn request_cancel(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE composition_jobs SET cancel_requested = 1, updated_at = ?
         WHERE id = ? AND state NOT IN ('completed', 'failed', 'canceled')",
    )
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Whether a cancel was requested for the job
pub async fn cancel_requested(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let flag: Option<i64> =
        sqlx::query_scalar("SELECT cancel_requested FROM composition_jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(pool)
            .await?;

    Ok(flag.unwrap_or(0) != 0)
}
