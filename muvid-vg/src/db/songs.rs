//! Song persistence

use crate::models::{AnalysisState, Song, VideoType};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn row_to_song(row: &sqlx::sqlite::SqliteRow) -> Result<Song> {
    let id: String = row.get("id");
    let video_type: Option<String> = row.get("video_type");
    let analysis_state: String = row.get("analysis_state");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    Ok(Song {
        id: Uuid::parse_str(&id).context("invalid song id")?,
        source_blob_key: row.get("source_blob_key"),
        original_filename: row.get("original_filename"),
        content_hash: row.get("content_hash"),
        duration_sec: row.get("duration_sec"),
        video_type: video_type.as_deref().and_then(VideoType::parse),
        selection_start_sec: row.get("selection_start_sec"),
        selection_end_sec: row.get("selection_end_sec"),
        character_image_key: row.get("character_image_key"),
        analysis_state: AnalysisState::parse(&analysis_state).unwrap_or(AnalysisState::Idle),
        created_at,
        updated_at,
    })
}

/// Insert a new song
pub async fn insert_song(pool: &SqlitePool, song: &Song) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO songs (
            id, source_blob_key, original_filename, content_hash, duration_sec,
            video_type, selection_start_sec, selection_end_sec,
            character_image_key, analysis_state, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(song.id.to_string())
    .bind(&song.source_blob_key)
    .bind(&song.original_filename)
    .bind(&song.content_hash)
    .bind(song.duration_sec)
    .bind(song.video_type.map(|v| v.as_str()))
    .bind(song.selection_start_sec)
    .bind(song.selection_end_sec)
    .bind(&song.character_image_key)
    .bind(song.analysis_state.as_str())
    .bind(song.created_at)
    .bind(song.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load song by id
pub async fn get_song(pool: &SqlitePool, song_id: Uuid) -> Result<Option<Song>> {
    let row = sqlx::query("SELECT * FROM songs WHERE id = ?")
        .bind(song_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_song).transpose()
}

/// List songs, newest first
pub async fn list_songs(pool: &SqlitePool, limit: i64) -> Result<Vec<Song>> {
    let rows = sqlx::query("SELECT * FROM songs ORDER BY created_at DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_song).collect()
}

/// Set the song duration, only if not already known
///
/// Duration is immutable once set; the conditional update makes repeated
/// analyses a no-op here.
pub async fn set_duration_if_unset(
    pool: &SqlitePool,
    song_id: Uuid,
    duration_sec: f64,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE songs SET duration_sec = ?, updated_at = ? WHERE id = ? AND duration_sec IS NULL",
    )
    .bind(duration_sec)
    .bind(Utc::now())
    .bind(song_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Set the video type, only while none is set
///
/// Returns false when a type was already chosen. The caller additionally
/// rejects the change once an analysis exists.
pub async fn set_video_type(pool: &SqlitePool, song_id: Uuid, video_type: VideoType) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE songs SET video_type = ?, updated_at = ? WHERE id = ? AND video_type IS NULL",
    )
    .bind(video_type.as_str())
    .bind(Utc::now())
    .bind(song_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Set the short-form selection window
pub async fn set_selection(
    pool: &SqlitePool,
    song_id: Uuid,
    start_sec: f64,
    end_sec: f64,
) -> Result<()> {
    sqlx::query(
        "UPDATE songs SET selection_start_sec = ?, selection_end_sec = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(start_sec)
    .bind(end_sec)
    .bind(Utc::now())
    .bind(song_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Update the analysis lifecycle state
pub async fn set_analysis_state(
    pool: &SqlitePool,
    song_id: Uuid,
    state: AnalysisState,
) -> Result<()> {
    sqlx::query("UPDATE songs SET analysis_state = ?, updated_at = ? WHERE id = ?")
        .bind(state.as_str())
        .bind(Utc::now())
        .bind(song_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Attach the character reference image blob
pub async fn set_character_image(
    pool: &SqlitePool,
    song_id: Uuid,
    blob_key: &str,
) -> Result<()> {
    sqlx::query("UPDATE songs SET character_image_key = ?, updated_at = ? WHERE id = ?")
        .bind(blob_key)
        .bind(Utc::now())
        .bind(song_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Delete a song; dependents cascade via foreign keys
pub async fn delete_song(pool: &SqlitePool, song_id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM songs WHERE id = ?")
        .bind(song_id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
