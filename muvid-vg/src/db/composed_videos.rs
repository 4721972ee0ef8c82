//! Composed video artifact persistence

use crate::models::ComposedVideo;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn row_to_video(row: &sqlx::sqlite::SqliteRow) -> Result<ComposedVideo> {
    let id: String = row.get("id");
    let song_id: String = row.get("song_id");
    let composition_job_id: String = row.get("composition_job_id");
    let clip_ids: String = row.get("clip_ids");
    let created_at: DateTime<Utc> = row.get("created_at");

    let clip_ids: Vec<String> = serde_json::from_str(&clip_ids).context("clip_ids json")?;
    let clip_ids = clip_ids
        .iter()
        .map(|s| Uuid::parse_str(s).context("invalid clip id"))
        .collect::<Result<Vec<_>>>()?;

    Ok(ComposedVideo {
        id: Uuid::parse_str(&id).context("invalid composed video id")?,
        song_id: Uuid::parse_str(&song_id).context("invalid song id")?,
        blob_key: row.get("blob_key"),
        width: row.get("width"),
        height: row.get("height"),
        fps: row.get("fps"),
        duration_sec: row.get("duration_sec"),
        byte_size: row.get("byte_size"),
        composition_job_id: Uuid::parse_str(&composition_job_id)
            .context("invalid composition job id")?,
        clip_ids,
        created_at,
    })
}

/// Insert the finished artifact record
pub async fn insert_video(pool: &SqlitePool, video: &ComposedVideo) -> Result<()> {
    let clip_ids: Vec<String> = video.clip_ids.iter().map(|id| id.to_string()).collect();

    sqlx::query(
        r#"
        INSERT INTO composed_videos (
            id, song_id, blob_key, width, height, fps, duration_sec,
            byte_size, composition_job_id, clip_ids, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(video.id.to_string())
    .bind(video.song_id.to_string())
    .bind(&video.blob_key)
    .bind(video.width)
    .bind(video.height)
    .bind(video.fps)
    .bind(video.duration_sec)
    .bind(video.byte_size)
    .bind(video.composition_job_id.to_string())
    .bind(serde_json::to_string(&clip_ids)?)
    .bind(video.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// The current (most recent) artifact for a song
pub async fn latest_for_song(pool: &SqlitePool, song_id: Uuid) -> Result<Option<ComposedVideo>> {
    let row = sqlx::query(
        "SELECT * FROM composed_videos WHERE song_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(song_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_video).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::Song;

    #[tokio::test]
    async fn test_latest_wins() {
        let pool = test_pool().await;
        let song = Song::new("k".to_string(), None);
        crate::db::songs::insert_song(&pool, &song).await.unwrap();

        for i in 0..2 {
            let video = ComposedVideo {
                id: Uuid::new_v4(),
                song_id: song.id,
                blob_key: format!("composed/{i}.mp4"),
                width: 1920,
                height: 1080,
                fps: 24.0,
                duration_sec: 30.0,
                byte_size: 1_000_000,
                composition_job_id: Uuid::new_v4(),
                clip_ids: vec![Uuid::new_v4()],
                created_at: Utc::now() + chrono::Duration::seconds(i),
            };
            insert_video(&pool, &video).await.unwrap();
        }

        let latest = latest_for_song(&pool, song.id).await.unwrap().unwrap();
        assert_eq!(latest.blob_key, "composed/1.mp4");
    }
}
