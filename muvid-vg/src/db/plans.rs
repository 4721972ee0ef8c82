//! Clip plan persistence

use crate::models::PlanEntry;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<PlanEntry> {
    let id: String = row.get("id");
    let song_id: String = row.get("song_id");
    let beat_indices: String = row.get("beat_indices");
    let created_at: DateTime<Utc> = row.get("created_at");

    Ok(PlanEntry {
        id: Uuid::parse_str(&id).context("invalid plan entry id")?,
        song_id: Uuid::parse_str(&song_id).context("invalid song id")?,
        plan_index: row.get("plan_index"),
        start_sec: row.get("start_sec"),
        end_sec: row.get("end_sec"),
        frame_count: row.get("frame_count"),
        target_fps: row.get("target_fps"),
        beat_indices: serde_json::from_str(&beat_indices).context("beat_indices json")?,
        created_at,
    })
}

/// Insert plan entries inside an open transaction
pub async fn insert_entries(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entries: &[PlanEntry],
) -> Result<()> {
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO clip_plan_entries (
                id, song_id, plan_index, start_sec, end_sec,
                frame_count, target_fps, beat_indices, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.song_id.to_string())
        .bind(entry.plan_index)
        .bind(entry.start_sec)
        .bind(entry.end_sec)
        .bind(entry.frame_count)
        .bind(entry.target_fps)
        .bind(serde_json::to_string(&entry.beat_indices)?)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

/// Delete all plan entries for a song inside an open transaction
pub async fn delete_for_song(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    song_id: Uuid,
) -> Result<()> {
    sqlx::query("DELETE FROM clip_plan_entries WHERE song_id = ?")
        .bind(song_id.to_string())
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Ordered plan entries for a song
pub async fn entries_for_song(pool: &SqlitePool, song_id: Uuid) -> Result<Vec<PlanEntry>> {
    let rows = sqlx::query(
        "SELECT * FROM clip_plan_entries WHERE song_id = ? ORDER BY plan_index ASC",
    )
    .bind(song_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_entry).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::Song;

    #[tokio::test]
    async fn test_replace_and_read_plan() {
        let pool = test_pool().await;
        let song = Song::new("k".to_string(), None);
        crate::db::songs::insert_song(&pool, &song).await.unwrap();

        let entries: Vec<PlanEntry> = (0..3)
            .map(|i| PlanEntry {
                id: Uuid::new_v4(),
                song_id: song.id,
                plan_index: i,
                start_sec: i as f64 * 5.0,
                end_sec: (i + 1) as f64 * 5.0,
                frame_count: 120,
                target_fps: 24,
                beat_indices: vec![i as usize],
                created_at: Utc::now(),
            })
            .collect();

        let mut tx = pool.begin().await.unwrap();
        insert_entries(&mut tx, &entries).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = entries_for_song(&pool, song.id).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].start_sec, 10.0);

        let mut tx = pool.begin().await.unwrap();
        delete_for_song(&mut tx, song.id).await.unwrap();
        tx.commit().await.unwrap();
        assert!(entries_for_song(&pool, song.id).await.unwrap().is_empty());
    }
}
