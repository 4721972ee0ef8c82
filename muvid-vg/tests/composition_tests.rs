//! Composition pipeline tests
//!
//! Runs the full state machine against fake encoder binaries: the fake
//! ffprobe reports 5 s per clip and 30 s for joined outputs at the
//! target resolution, and the fake ffmpeg writes its output file. This
//! exercises every step transition, validation, verification, artifact
//! recording, cancellation, and temp cleanup without a real encoder.

#![cfg(unix)]

mod common;

use chrono::Utc;
use muvid_vg::models::{Clip, CompositionState, JobStatus, PlanEntry};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Seed the short-form fixture with `n` completed 5 s clips whose result
/// URLs point at real files
async fn seed_completed_clips(
    state: &muvid_vg::AppState,
    song_id: Uuid,
    results_dir: &std::path::Path,
    n: usize,
) {
    let mut entries = Vec::new();
    let mut clips = Vec::new();
    for i in 0..n {
        entries.push(PlanEntry {
            id: Uuid::new_v4(),
            song_id,
            plan_index: i as i64,
            start_sec: 40.0 + i as f64 * 5.0,
            end_sec: 45.0 + i as f64 * 5.0,
            frame_count: 120,
            target_fps: 24,
            beat_indices: vec![],
            created_at: Utc::now(),
        });
        clips.push(Clip::new(song_id, i as i64, "prompt".into(), 1, 120, 24));
    }

    let mut tx = state.db.begin().await.unwrap();
    muvid_vg::db::plans::insert_entries(&mut tx, &entries)
        .await
        .unwrap();
    muvid_vg::db::clips::insert_clips(&mut tx, &clips).await.unwrap();
    tx.commit().await.unwrap();

    for (i, clip) in clips.iter().enumerate() {
        let path = results_dir.join(format!("result_{i}.mp4"));
        std::fs::write(&path, b"generated-clip").unwrap();
        muvid_vg::db::clips::claim_for_processing(&state.db, clip.id)
            .await
            .unwrap();
        muvid_vg::db::clips::mark_completed(
            &state.db,
            clip.id,
            &path.display().to_string(),
            Some(1920),
            Some(1080),
            Some(24.0),
        )
        .await
        .unwrap();
    }
}

async fn claim_compose_job(state: &muvid_vg::AppState) -> muvid_vg::models::JobRecord {
    muvid_vg::db::jobs::claim_next(&state.db, &state.config.default_queue())
        .await
        .expect("claim")
        .expect("compose job available")
}

#[tokio::test]
async fn test_short_form_happy_path() {
    let (state, dir) = common::test_state(None).await;
    common::install_fake_encoders(dir.path());

    let song = common::seed_analyzed_song(&state).await;
    let results = dir.path().join("results");
    std::fs::create_dir_all(&results).unwrap();
    seed_completed_clips(&state, song.id, &results, 6).await;

    let (composition, job) =
        muvid_vg::compose::enqueue_composition(&state.db, &state.config, song.id)
            .await
            .expect("enqueue");

    let ctx = state.worker_context();
    let claimed = claim_compose_job(&state).await;
    assert_eq!(claimed.id, job.id);

    muvid_vg::compose::run_composition_job(&ctx, &claimed, &CancellationToken::new())
        .await
        .expect("run");

    // Composition landed on completed with full progress
    let row = muvid_vg::db::compositions::get_job(&state.db, composition.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state, CompositionState::Completed);
    assert_eq!(row.progress, 100.0);
    assert!(row.error.is_none());

    // The artifact record matches the target parameters: 30 s, 1080p, 24
    // fps, and its blob exists
    let video = muvid_vg::db::composed_videos::latest_for_song(&state.db, song.id)
        .await
        .unwrap()
        .expect("composed video row");
    assert_eq!(video.width, 1920);
    assert_eq!(video.height, 1080);
    assert_eq!(video.fps, 24.0);
    assert!((video.duration_sec - 30.0).abs() <= 1.0 / 24.0);
    assert_eq!(video.clip_ids.len(), 6);
    assert!(state.blobs.exists(&video.blob_key).await);
    assert!(video.byte_size > 0);

    // Temp intermediates are gone
    let temp = state.config.temp_root().join(composition.id.to_string());
    assert!(!temp.exists());

    // Job row reports completed with a result payload
    let job_row = muvid_vg::db::jobs::get_job(&state.db, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job_row.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_cancellation_leaves_no_artifact() {
    let (state, dir) = common::test_state(None).await;
    common::install_fake_encoders(dir.path());

    let song = common::seed_analyzed_song(&state).await;
    let results = dir.path().join("results");
    std::fs::create_dir_all(&results).unwrap();
    seed_completed_clips(&state, song.id, &results, 6).await;

    let (composition, job) =
        muvid_vg::compose::enqueue_composition(&state.db, &state.config, song.id)
            .await
            .unwrap();

    // Cancel lands before the worker reaches the first checkpoint
    muvid_vg::db::compositions::request_cancel(&state.db, composition.id)
        .await
        .unwrap();

    let ctx = state.worker_context();
    let claimed = claim_compose_job(&state).await;
    muvid_vg::compose::run_composition_job(&ctx, &claimed, &CancellationToken::new())
        .await
        .unwrap();

    let row = muvid_vg::db::compositions::get_job(&state.db, composition.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state, CompositionState::Canceled);

    // No ComposedVideo row, no temp leftovers, job canceled not failed
    assert!(
        muvid_vg::db::composed_videos::latest_for_song(&state.db, song.id)
            .await
            .unwrap()
            .is_none()
    );
    let temp = state.config.temp_root().join(composition.id.to_string());
    assert!(!temp.exists());
    let job_row = muvid_vg::db::jobs::get_job(&state.db, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job_row.status, JobStatus::Canceled);
    assert!(job_row.error.is_none());
}

#[tokio::test]
async fn test_overshoot_beyond_extension_budget_fails() {
    let (state, dir) = common::test_state(None).await;
    common::install_fake_encoders(dir.path());

    let song = common::seed_analyzed_song(&state).await;
    let results = dir.path().join("results");
    std::fs::create_dir_all(&results).unwrap();
    // 8 clips x 5 s = 40 s against a 30 s selection: 7 s past the 3 s
    // extension budget
    seed_completed_clips(&state, song.id, &results, 8).await;

    let (composition, job) =
        muvid_vg::compose::enqueue_composition(&state.db, &state.config, song.id)
            .await
            .unwrap();

    let ctx = state.worker_context();
    let claimed = claim_compose_job(&state).await;
    muvid_vg::compose::run_composition_job(&ctx, &claimed, &CancellationToken::new())
        .await
        .unwrap();

    let row = muvid_vg::db::compositions::get_job(&state.db, composition.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state, CompositionState::Failed);
    assert!(row.error.as_deref().unwrap().contains("extension budget"));

    let job_row = muvid_vg::db::jobs::get_job(&state.db, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job_row.status, JobStatus::Failed);
    assert!(
        muvid_vg::db::composed_videos::latest_for_song(&state.db, song.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_missing_encoder_fails_with_message() {
    let (state, _dir) = common::test_state(None).await;
    // No fake encoders installed: ffprobe spawn fails in validation

    let song = common::seed_analyzed_song(&state).await;
    let results = state.config.root_folder.join("results");
    std::fs::create_dir_all(&results).unwrap();
    seed_completed_clips(&state, song.id, &results, 6).await;

    let (composition, _job) =
        muvid_vg::compose::enqueue_composition(&state.db, &state.config, song.id)
            .await
            .unwrap();

    let ctx = state.worker_context();
    let claimed = claim_compose_job(&state).await;
    muvid_vg::compose::run_composition_job(&ctx, &claimed, &CancellationToken::new())
        .await
        .unwrap();

    let row = muvid_vg::db::compositions::get_job(&state.db, composition.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state, CompositionState::Failed);
    assert!(row.error.as_deref().unwrap().contains("unreadable"));
}

#[tokio::test]
async fn test_beat_effect_filter_applies_on_happy_path() {
    let (state, dir) = common::test_state_with(None, |config| {
        config.beat_effect.enabled = true;
        config.beat_effect.kind = muvid_vg::config::BeatEffectKind::Flash;
    })
    .await;
    common::install_fake_encoders(dir.path());

    let song = common::seed_analyzed_song(&state).await;
    let results = dir.path().join("results");
    std::fs::create_dir_all(&results).unwrap();
    seed_completed_clips(&state, song.id, &results, 6).await;

    let (composition, _job) =
        muvid_vg::compose::enqueue_composition(&state.db, &state.config, song.id)
            .await
            .unwrap();

    let ctx = state.worker_context();
    let claimed = claim_compose_job(&state).await;
    muvid_vg::compose::run_composition_job(&ctx, &claimed, &CancellationToken::new())
        .await
        .unwrap();

    // The effects step ran and the pipeline still completed
    let row = muvid_vg::db::compositions::get_job(&state.db, composition.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state, CompositionState::Completed);
}
