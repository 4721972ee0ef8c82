//! Database schema initialization
//!
//! Idempotent CREATE TABLE IF NOT EXISTS statements run at pool creation.
//! Songs own every dependent row; deletes cascade.

use anyhow::Result;
use sqlx::SqlitePool;

/// Initialize the complete schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS songs (
            id TEXT PRIMARY KEY,
            source_blob_key TEXT NOT NULL,
            original_filename TEXT,
            content_hash TEXT,
            duration_sec REAL,
            video_type TEXT,
            selection_start_sec REAL,
            selection_end_sec REAL,
            character_image_key TEXT,
            analysis_state TEXT NOT NULL DEFAULT 'idle',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS song_analyses (
            id TEXT PRIMARY KEY,
            song_id TEXT NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
            version INTEGER NOT NULL,
            bpm REAL,
            beat_times TEXT NOT NULL,
            sections TEXT NOT NULL,
            mood TEXT,
            mood_tags TEXT NOT NULL,
            genre TEXT,
            waveform TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(song_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clip_plan_entries (
            id TEXT PRIMARY KEY,
            song_id TEXT NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
            plan_index INTEGER NOT NULL,
            start_sec REAL NOT NULL,
            end_sec REAL NOT NULL,
            frame_count INTEGER NOT NULL,
            target_fps INTEGER NOT NULL,
            beat_indices TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(song_id, plan_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clips (
            id TEXT PRIMARY KEY,
            song_id TEXT NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
            plan_index INTEGER NOT NULL,
            prompt TEXT NOT NULL,
            seed INTEGER NOT NULL,
            requested_frames INTEGER NOT NULL,
            requested_fps INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            external_job_id TEXT,
            result_url TEXT,
            result_width INTEGER,
            result_height INTEGER,
            result_fps REAL,
            error TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(song_id, plan_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_clips_song_status ON clips(song_id, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS composition_jobs (
            id TEXT PRIMARY KEY,
            song_id TEXT NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
            clip_ids TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'queued',
            progress REAL NOT NULL DEFAULT 0,
            error TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS composed_videos (
            id TEXT PRIMARY KEY,
            song_id TEXT NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
            blob_key TEXT NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            fps REAL NOT NULL,
            duration_sec REAL NOT NULL,
            byte_size INTEGER NOT NULL,
            composition_job_id TEXT NOT NULL,
            clip_ids TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            kind TEXT NOT NULL,
            song_id TEXT,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            progress REAL NOT NULL DEFAULT 0,
            error TEXT,
            attempt INTEGER NOT NULL DEFAULT 0,
            timeout_sec INTEGER NOT NULL,
            available_at TEXT NOT NULL,
            claimed_at TEXT,
            finished_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_queue_claim
         ON jobs(queue, status, available_at, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_song_kind ON jobs(song_id, kind, created_at)")
        .execute(pool)
        .await?;

    Ok(())
}
