//! Clip generation workflow tests
//!
//! Drives the coordinator's per-clip jobs against a scripted mock
//! generator: retry with backoff, permanent failure, the per-song
//! concurrency cap, and batch cancellation. Result verification runs
//! through the fake ffprobe installed by the common helpers.

#![cfg(unix)]

mod common;

use common::{MockGenerator, ScriptedRun};
use muvid_vg::models::{ClipStatus, JobKind, JobStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Claim the next job from the clip queue, skipping nothing
async fn claim_clip_job(state: &muvid_vg::AppState) -> muvid_vg::models::JobRecord {
    muvid_vg::db::jobs::claim_next(&state.db, &state.config.clip_queue())
        .await
        .expect("claim")
        .expect("job available")
}

async fn plan_single_clip(state: &muvid_vg::AppState) -> muvid_vg::models::Song {
    let song = common::seed_analyzed_song(state).await;
    // Narrow the selection so the plan is exactly one clip
    muvid_vg::db::songs::set_selection(&state.db, song.id, 40.0, 45.0)
        .await
        .unwrap();
    muvid_vg::clips::plan_clips(&state.db, &state.config, &state.event_bus, song.id, None, None)
        .await
        .expect("plan");
    song
}

#[tokio::test]
async fn test_retry_path_succeeds_on_second_attempt() {
    let dir_for_results = tempfile::tempdir().unwrap();
    let generator = Arc::new(MockGenerator::new(
        dir_for_results.path().to_path_buf(),
        vec![
            ScriptedRun::FailRetriable("gpu fell over".to_string()),
            ScriptedRun::Succeed { polls: 0 },
        ],
    ));

    let (state, dir) = common::test_state_with(Some(generator.clone()), |config| {
        config.retry.initial_backoff_sec = 0.05;
        config.generation.poll_interval_sec = 1;
    })
    .await;
    common::install_fake_encoders(dir.path());

    let song = plan_single_clip(&state).await;
    let batch = muvid_vg::clips::generate(&state.db, &state.config, song.id)
        .await
        .expect("generate");
    assert_eq!(batch.kind, JobKind::ClipBatch);

    let ctx = state.worker_context();

    // First claim is the batch monitor; set it aside, it only aggregates
    let batch_job = claim_clip_job(&state).await;
    assert_eq!(batch_job.kind, JobKind::ClipBatch);

    // Attempt 1: scripted retriable failure
    let job = claim_clip_job(&state).await;
    assert_eq!(job.kind, JobKind::ClipGenerate);
    muvid_vg::clips::run_clip_job(&ctx, &job, &CancellationToken::new())
        .await
        .expect("run");

    let clips = muvid_vg::db::clips::clips_for_song(&state.db, song.id)
        .await
        .unwrap();
    assert_eq!(clips[0].status, ClipStatus::Queued);
    assert_eq!(clips[0].attempt_count, 1);
    assert!(clips[0].error.as_deref().unwrap().contains("gpu fell over"));

    // Backoff delay before the retry job becomes claimable
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    // Attempt 2: scripted success
    let job = claim_clip_job(&state).await;
    muvid_vg::clips::run_clip_job(&ctx, &job, &CancellationToken::new())
        .await
        .expect("run");

    let clip = &muvid_vg::db::clips::clips_for_song(&state.db, song.id)
        .await
        .unwrap()[0];
    assert_eq!(clip.status, ClipStatus::Completed);
    assert_eq!(clip.attempt_count, 2);
    assert!(clip.error.is_none());
    assert!(clip.result_url.is_some());

    // Both attempts submitted under distinct idempotency keys
    let submissions = generator.submissions().await;
    assert_eq!(submissions.len(), 2);
    assert_ne!(submissions[0].idempotency_key, submissions[1].idempotency_key);

    // The batch monitor settles once every clip is terminal
    muvid_vg::clips::run_batch_job(&ctx, &batch_job, &CancellationToken::new())
        .await
        .expect("batch");
    let batch_row = muvid_vg::db::jobs::get_job(&state.db, batch_job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch_row.status, JobStatus::Completed);
    assert_eq!(batch_row.progress, 100.0);
}

#[tokio::test]
async fn test_permanent_failure_is_immediate_and_retryable_by_user() {
    let results = tempfile::tempdir().unwrap();
    let generator = Arc::new(MockGenerator::new(
        results.path().to_path_buf(),
        vec![
            ScriptedRun::FailPermanent("moderation block".to_string()),
            ScriptedRun::Succeed { polls: 0 },
        ],
    ));

    let (state, dir) = common::test_state_with(Some(generator), |config| {
        config.generation.poll_interval_sec = 1;
    })
    .await;
    common::install_fake_encoders(dir.path());

    let song = plan_single_clip(&state).await;
    muvid_vg::clips::generate(&state.db, &state.config, song.id)
        .await
        .unwrap();

    let ctx = state.worker_context();
    let batch_job = claim_clip_job(&state).await;
    assert_eq!(batch_job.kind, JobKind::ClipBatch);

    let job = claim_clip_job(&state).await;
    muvid_vg::clips::run_clip_job(&ctx, &job, &CancellationToken::new())
        .await
        .unwrap();

    // No automatic retry on a permanent provider error
    let clip = &muvid_vg::db::clips::clips_for_song(&state.db, song.id)
        .await
        .unwrap()[0];
    assert_eq!(clip.status, ClipStatus::Failed);
    assert_eq!(clip.attempt_count, 1);
    assert!(clip.error.as_deref().unwrap().contains("moderation block"));

    // User-driven retry resets the machine; completion afterwards is
    // indistinguishable from a first-time success
    let reset = muvid_vg::clips::retry_clip(&state.db, &state.config, clip.id)
        .await
        .unwrap();
    assert_eq!(reset.status, ClipStatus::Queued);
    assert!(reset.error.is_none());

    let job = claim_clip_job(&state).await;
    muvid_vg::clips::run_clip_job(&ctx, &job, &CancellationToken::new())
        .await
        .unwrap();

    let clip = &muvid_vg::db::clips::clips_for_song(&state.db, song.id)
        .await
        .unwrap()[0];
    assert_eq!(clip.status, ClipStatus::Completed);
    assert!(clip.error.is_none());
}

#[tokio::test]
async fn test_per_song_concurrency_cap_defers_claims() {
    let results = tempfile::tempdir().unwrap();
    let generator = Arc::new(MockGenerator::new(results.path().to_path_buf(), vec![]));

    let (state, dir) = common::test_state_with(Some(generator), |config| {
        config.workers.worker_concurrency_per_song = 4;
    })
    .await;
    common::install_fake_encoders(dir.path());

    let song = common::seed_analyzed_song(&state).await;
    muvid_vg::clips::plan_clips(
        &state.db,
        &state.config,
        &state.event_bus,
        song.id,
        Some(6),
        None,
    )
    .await
    .unwrap();

    let clips = muvid_vg::db::clips::clips_for_song(&state.db, song.id)
        .await
        .unwrap();
    assert_eq!(clips.len(), 6);

    // Four clips already generating fills the cap
    for clip in clips.iter().take(4) {
        assert!(muvid_vg::db::clips::claim_for_processing(&state.db, clip.id)
            .await
            .unwrap());
    }

    muvid_vg::clips::generate(&state.db, &state.config, song.id)
        .await
        .unwrap();
    let ctx = state.worker_context();

    let batch_job = claim_clip_job(&state).await;
    assert_eq!(batch_job.kind, JobKind::ClipBatch);

    // The fifth clip's job defers instead of exceeding the cap
    let job = claim_clip_job(&state).await;
    muvid_vg::clips::run_clip_job(&ctx, &job, &CancellationToken::new())
        .await
        .unwrap();

    let counts = muvid_vg::db::clips::status_counts(&state.db, song.id)
        .await
        .unwrap();
    assert_eq!(counts.processing, 4, "cap must hold at a sampled instant");
    assert_eq!(counts.queued, 2);

    // The deferred clip made no generation attempt
    let clips = muvid_vg::db::clips::clips_for_song(&state.db, song.id)
        .await
        .unwrap();
    for clip in clips.iter().filter(|c| c.status == ClipStatus::Queued) {
        assert_eq!(clip.attempt_count, 0);
    }
}

#[tokio::test]
async fn test_cancel_batch_stops_pending_clips() {
    let results = tempfile::tempdir().unwrap();
    let generator = Arc::new(MockGenerator::new(results.path().to_path_buf(), vec![]));

    let (state, dir) = common::test_state(Some(generator)).await;
    common::install_fake_encoders(dir.path());

    let song = common::seed_analyzed_song(&state).await;
    muvid_vg::clips::plan_clips(
        &state.db,
        &state.config,
        &state.event_bus,
        song.id,
        Some(6),
        None,
    )
    .await
    .unwrap();
    let batch = muvid_vg::clips::generate(&state.db, &state.config, song.id)
        .await
        .unwrap();

    let ctx = state.worker_context();

    // A worker already holds the batch monitor when the cancel arrives
    let batch_job = claim_clip_job(&state).await;
    assert_eq!(batch_job.kind, JobKind::ClipBatch);

    muvid_vg::clips::cancel_batch(&ctx, batch.id).await.unwrap();

    // Every queued clip flipped to canceled, none will be dequeued
    let counts = muvid_vg::db::clips::status_counts(&state.db, song.id)
        .await
        .unwrap();
    assert_eq!(counts.canceled, 6);
    assert_eq!(counts.queued, 0);

    // The batch monitor observes the cancel and lands on canceled
    muvid_vg::clips::run_batch_job(&ctx, &batch_job, &CancellationToken::new())
        .await
        .unwrap();

    let row = muvid_vg::db::jobs::get_job(&state.db, batch.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, JobStatus::Canceled);

    // Cancellation surfaces as canceled, never failed
    let clips = muvid_vg::db::clips::clips_for_song(&state.db, song.id)
        .await
        .unwrap();
    assert!(clips.iter().all(|c| c.status == ClipStatus::Canceled));
}

#[tokio::test]
async fn test_duplicate_delivery_drops_cleanly() {
    let results = tempfile::tempdir().unwrap();
    let generator = Arc::new(MockGenerator::new(
        results.path().to_path_buf(),
        vec![ScriptedRun::Succeed { polls: 0 }],
    ));

    let (state, dir) = common::test_state_with(Some(generator.clone()), |config| {
        config.generation.poll_interval_sec = 1;
    })
    .await;
    common::install_fake_encoders(dir.path());

    let song = plan_single_clip(&state).await;
    muvid_vg::clips::generate(&state.db, &state.config, song.id)
        .await
        .unwrap();

    let ctx = state.worker_context();
    let _batch_job = claim_clip_job(&state).await;
    let job = claim_clip_job(&state).await;

    muvid_vg::clips::run_clip_job(&ctx, &job, &CancellationToken::new())
        .await
        .unwrap();

    // At-least-once delivery can hand the same job to another worker;
    // the clip claim CAS makes the rerun a no-op
    muvid_vg::clips::run_clip_job(&ctx, &job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(generator.submissions().await.len(), 1);
    let clip = &muvid_vg::db::clips::clips_for_song(&state.db, song.id)
        .await
        .unwrap()[0];
    assert_eq!(clip.status, ClipStatus::Completed);
    assert_eq!(clip.attempt_count, 1);
}
