//! Song analysis persistence
//!
//! One logical analysis per song, versioned; the latest version wins.

use crate::models::{MoodVector, Section, SongAnalysis};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn row_to_analysis(row: &sqlx::sqlite::SqliteRow) -> Result<SongAnalysis> {
    let id: String = row.get("id");
    let song_id: String = row.get("song_id");
    let beat_times: String = row.get("beat_times");
    let sections: String = row.get("sections");
    let mood: Option<String> = row.get("mood");
    let mood_tags: String = row.get("mood_tags");
    let waveform: String = row.get("waveform");
    let created_at: DateTime<Utc> = row.get("created_at");

    Ok(SongAnalysis {
        id: Uuid::parse_str(&id).context("invalid analysis id")?,
        song_id: Uuid::parse_str(&song_id).context("invalid song id")?,
        version: row.get("version"),
        bpm: row.get("bpm"),
        beat_times: serde_json::from_str::<Vec<f64>>(&beat_times).context("beat_times json")?,
        sections: serde_json::from_str::<Vec<Section>>(&sections).context("sections json")?,
        mood: mood
            .map(|m| serde_json::from_str::<MoodVector>(&m))
            .transpose()
            .context("mood json")?,
        mood_tags: serde_json::from_str::<Vec<String>>(&mood_tags).context("mood_tags json")?,
        genre: row.get("genre"),
        waveform: serde_json::from_str::<Vec<f32>>(&waveform).context("waveform json")?,
        created_at,
    })
}

/// Save an analysis as the next version for its song
///
/// The version is assigned here so concurrent re-analyses cannot collide
/// on (song_id, version); the UNIQUE constraint backs this up.
pub async fn save_analysis(pool: &SqlitePool, analysis: &mut SongAnalysis) -> Result<()> {
    let next: i64 = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT MAX(version) FROM song_analyses WHERE song_id = ?",
    )
    .bind(analysis.song_id.to_string())
    .fetch_one(pool)
    .await?
    .unwrap_or(0)
        + 1;

    analysis.version = next;

    sqlx::query(
        r#"
        INSERT INTO song_analyses (
            id, song_id, version, bpm, beat_times, sections,
            mood, mood_tags, genre, waveform, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(analysis.id.to_string())
    .bind(analysis.song_id.to_string())
    .bind(analysis.version)
    .bind(analysis.bpm)
    .bind(serde_json::to_string(&analysis.beat_times)?)
    .bind(serde_json::to_string(&analysis.sections)?)
    .bind(
        analysis
            .mood
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    )
    .bind(serde_json::to_string(&analysis.mood_tags)?)
    .bind(&analysis.genre)
    .bind(serde_json::to_string(&analysis.waveform)?)
    .bind(analysis.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Latest analysis for a song, if any
pub async fn latest_for_song(pool: &SqlitePool, song_id: Uuid) -> Result<Option<SongAnalysis>> {
    let row = sqlx::query(
        "SELECT * FROM song_analyses WHERE song_id = ? ORDER BY version DESC LIMIT 1",
    )
    .bind(song_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_analysis).transpose()
}

/// Whether any analysis exists for a song
pub async fn exists_for_song(pool: &SqlitePool, song_id: Uuid) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM song_analyses WHERE song_id = ?")
            .bind(song_id.to_string())
            .fetch_one(pool)
            .await?;

    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::Song;

    #[tokio::test]
    async fn test_later_analysis_supersedes() {
        let pool = test_pool().await;
        let song = Song::new("k".to_string(), None);
        crate::db::songs::insert_song(&pool, &song).await.unwrap();

        let mut first = SongAnalysis::new(song.id, 0);
        first.bpm = Some(100.0);
        save_analysis(&pool, &mut first).await.unwrap();
        assert_eq!(first.version, 1);

        let mut second = SongAnalysis::new(song.id, 0);
        second.bpm = Some(120.0);
        save_analysis(&pool, &mut second).await.unwrap();
        assert_eq!(second.version, 2);

        let latest = latest_for_song(&pool, song.id).await.unwrap().unwrap();
        assert_eq!(latest.bpm, Some(120.0));
        assert!(exists_for_song(&pool, song.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_analysis_round_trips_collections() {
        let pool = test_pool().await;
        let song = Song::new("k".to_string(), None);
        crate::db::songs::insert_song(&pool, &song).await.unwrap();

        let mut analysis = SongAnalysis::new(song.id, 0);
        analysis.beat_times = vec![0.5, 1.0, 1.5];
        analysis.mood = Some(MoodVector {
            energy: 0.8,
            valence: 0.6,
            danceability: 0.7,
            tension: 0.3,
        });
        analysis.mood_tags = vec!["energetic".to_string()];
        analysis.waveform = vec![0.1, 0.9, 0.5];
        save_analysis(&pool, &mut analysis).await.unwrap();

        let loaded = latest_for_song(&pool, song.id).await.unwrap().unwrap();
        assert_eq!(loaded.beat_times, vec![0.5, 1.0, 1.5]);
        assert_eq!(loaded.mood_tags, vec!["energetic".to_string()]);
        assert_eq!(loaded.waveform.len(), 3);
        assert!(loaded.mood.is_some());
    }
}
