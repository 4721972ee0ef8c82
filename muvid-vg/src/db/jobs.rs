//! Job queue storage
//!
//! Named FIFO queues over a single jobs table. Delivery is at-least-once:
//! a claim is a compare-and-set from queued to processing, and a reaper
//! returns expired claims (crashed workers) to queued. FIFO order is
//! (created_at, id) per queue; `available_at` implements delayed
//! re-enqueue for retry backoff.

use crate::models::{JobKind, JobRecord, JobStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord> {
    let id: String = row.get("id");
    let kind: String = row.get("kind");
    let song_id: Option<String> = row.get("song_id");
    let payload: String = row.get("payload");
    let status: String = row.get("status");
    let available_at: DateTime<Utc> = row.get("available_at");
    let claimed_at: Option<DateTime<Utc>> = row.get("claimed_at");
    let finished_at: Option<DateTime<Utc>> = row.get("finished_at");
    let created_at: DateTime<Utc> = row.get("created_at");

    Ok(JobRecord {
        id: Uuid::parse_str(&id).context("invalid job id")?,
        queue: row.get("queue"),
        kind: JobKind::parse(&kind)
            .with_context(|| format!("unknown job kind: {kind}"))?,
        song_id: song_id
            .map(|s| Uuid::parse_str(&s).context("invalid song id"))
            .transpose()?,
        payload: serde_json::from_str(&payload).context("payload json")?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        progress: row.get("progress"),
        error: row.get("error"),
        attempt: row.get("attempt"),
        timeout_sec: row.get("timeout_sec"),
        available_at,
        claimed_at,
        finished_at,
        created_at,
    })
}

/// Enqueue a job
pub async fn enqueue(pool: &SqlitePool, job: &JobRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, queue, kind, song_id, payload, status, progress, error,
            attempt, timeout_sec, available_at, claimed_at, finished_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id.to_string())
    .bind(&job.queue)
    .bind(job.kind.as_str())
    .bind(job.song_id.map(|id| id.to_string()))
    .bind(serde_json::to_string(&job.payload)?)
    .bind(job.status.as_str())
    .bind(job.progress)
    .bind(&job.error)
    .bind(job.attempt)
    .bind(job.timeout_sec)
    .bind(job.available_at)
    .bind(job.claimed_at)
    .bind(job.finished_at)
    .bind(job.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Claim the next available job from a queue
///
/// FIFO by (created_at, id). Returns None when the queue has nothing
/// claimable. Lost CAS races retry against the next candidate.
pub async fn claim_next(pool: &SqlitePool, queue: &str) -> Result<Option<JobRecord>> {
    loop {
        let now = Utc::now();
        let row = sqlx::query(
            "SELECT * FROM jobs
             WHERE queue = ? AND status = 'queued' AND available_at <= ?
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(queue)
        .bind(now)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = row_to_job(&row)?;

        let result = sqlx::query(
            "UPDATE jobs SET status = 'processing', claimed_at = ?, attempt = attempt + 1
             WHERE id = ? AND status = 'queued'",
        )
        .bind(now)
        .bind(job.id.to_string())
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            job.status = JobStatus::Processing;
            job.claimed_at = Some(now);
            job.attempt += 1;
            return Ok(Some(job));
        }
        // Another worker won the claim; try the next candidate.
    }
}

/// Load job by id
pub async fn get_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<JobRecord>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// Update job progress (monotonic non-decreasing)
pub async fn set_progress(pool: &SqlitePool, job_id: Uuid, progress: f64) -> Result<()> {
    sqlx::query("UPDATE jobs SET progress = MAX(progress, ?) WHERE id = ?")
        .bind(progress)
        .bind(job_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Complete a job
pub async fn mark_completed(pool: &SqlitePool, job_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'completed', progress = 100, finished_at = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Fail a job with a message
pub async fn mark_failed(pool: &SqlitePool, job_id: Uuid, error: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = 'failed', error = ?, finished_at = ? WHERE id = ?")
        .bind(error)
        .bind(Utc::now())
        .bind(job_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Request cancellation of a job
///
/// Queued jobs flip straight to canceled (no worker holds them); a
/// processing job is marked canceling and the worker transitions it to
/// canceled at its next checkpoint. Returns false for terminal jobs.
pub async fn request_cancel(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'canceled', finished_at = ?
         WHERE id = ? AND status = 'queued'",
    )
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;
    if result.rows_affected() > 0 {
        return Ok(true);
    }

    let result = sqlx::query(
        "UPDATE jobs SET status = 'canceling' WHERE id = ? AND status = 'processing'",
    )
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Transition a canceling (or processing) job to canceled
pub async fn mark_canceled(pool: &SqlitePool, job_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'canceled', finished_at = ?
         WHERE id = ? AND status IN ('processing', 'canceling')",
    )
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Whether cancellation was requested for a job (checkpoint probe)
pub async fn is_canceling(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    Ok(matches!(status.as_deref(), Some("canceling") | Some("canceled")))
}

/// Return expired processing claims to queued
///
/// A claim expires when the worker holding it has been silent past the
/// job's timeout (crash, OOM, deploy). At-least-once delivery: the job
/// runs again on another worker.
pub async fn reap_expired(pool: &SqlitePool) -> Result<u64> {
    let rows = sqlx::query(
        "SELECT id, claimed_at, timeout_sec FROM jobs WHERE status = 'processing'",
    )
    .fetch_all(pool)
    .await?;

    let now = Utc::now();
    let mut reaped = 0u64;

    for row in rows {
        let id: String = row.get("id");
        let claimed_at: Option<DateTime<Utc>> = row.get("claimed_at");
        let timeout_sec: i64 = row.get("timeout_sec");

        let Some(claimed_at) = claimed_at else { continue };
        if now - claimed_at < Duration::seconds(timeout_sec) {
            continue;
        }

        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', claimed_at = NULL, available_at = ?
             WHERE id = ? AND status = 'processing' AND claimed_at = ?",
        )
        .bind(now)
        .bind(&id)
        .bind(claimed_at)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::warn!(job_id = %id, timeout_sec, "Reaped expired job claim back to queued");
            reaped += 1;
        }
    }

    Ok(reaped)
}

/// Cancel all of a song's per-clip generation jobs
///
/// Queued jobs flip to canceled; processing jobs are marked canceling
/// for their workers to observe. Returns the ids of every job touched so
/// in-process cancellation tokens can be fired too.
pub async fn cancel_clip_jobs_for_song(pool: &SqlitePool, song_id: Uuid) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        "SELECT id FROM jobs WHERE song_id = ? AND kind = 'clip_generate'
           AND status IN ('queued', 'processing')",
    )
    .bind(song_id.to_string())
    .fetch_all(pool)
    .await?;

    let ids: Vec<Uuid> = rows
        .iter()
        .filter_map(|row| {
            let id: String = row.get("id");
            Uuid::parse_str(&id).ok()
        })
        .collect();

    sqlx::query(
        "UPDATE jobs SET status = 'canceled', finished_at = ?
         WHERE song_id = ? AND kind = 'clip_generate' AND status = 'queued'",
    )
    .bind(Utc::now())
    .bind(song_id.to_string())
    .execute(pool)
    .await?;

    sqlx::query(
        "UPDATE jobs SET status = 'canceling'
         WHERE song_id = ? AND kind = 'clip_generate' AND status = 'processing'",
    )
    .bind(song_id.to_string())
    .execute(pool)
    .await?;

    Ok(ids)
}

/// Most recent job of a kind for a song
///
/// Backs status reconstruction after a page reload: the client asks for
/// the latest (song, kind) job row instead of holding session state.
pub async fn latest_for_song_kind(
    pool: &SqlitePool,
    song_id: Uuid,
    kind: JobKind,
) -> Result<Option<JobRecord>> {
    let row = sqlx::query(
        "SELECT * FROM jobs WHERE song_id = ? AND kind = ?
         ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(song_id.to_string())
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// The active (non-terminal) batch generation job for a song, if any
pub async fn active_batch_for_song(
    pool: &SqlitePool,
    song_id: Uuid,
) -> Result<Option<JobRecord>> {
    let row = sqlx::query(
        "SELECT * FROM jobs
         WHERE song_id = ? AND kind = 'clip_batch'
           AND status IN ('queued', 'processing', 'canceling')
         ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(song_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_job).transpose()
}
