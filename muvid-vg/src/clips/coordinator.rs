//! Clip generation coordinator
//!
//! Owns the clip lifecycle: plan regeneration from the current analysis,
//! batch enqueueing under the per-song concurrency cap, per-clip job
//! execution with at-most-once external submission, retry with backoff,
//! aggregate status, and cooperative cancellation.

use crate::config::AppConfig;
use crate::models::{
    Clip, ClipStatus, JobKind, JobRecord, PlanEntry, Section, SectionKind, VideoType,
};
use crate::planning::{align_clips, plan_scene, AlignmentResult, BeatAlignParams};
use crate::queue::WorkerContext;
use crate::storage::BlobStore;
use chrono::Utc;
use muvid_common::events::MuvidEvent;
use muvid_common::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Payload of a per-clip generation job
#[derive(Debug, Serialize, Deserialize)]
pub struct ClipJobPayload {
    pub clip_id: Uuid,
    pub batch_job_id: Option<Uuid>,
}

/// Payload of a batch monitor job
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchJobPayload {
    pub song_id: Uuid,
}

/// Result of plan regeneration
#[derive(Debug)]
pub struct PlanOutcome {
    pub entries: Vec<PlanEntry>,
    pub clips: Vec<Clip>,
    pub alignment: AlignmentResult,
    /// Completed clips from the prior plan that survived (same index,
    /// same bounds)
    pub reused: usize,
}

/// Aggregate generation status for a song
#[derive(Debug, Serialize)]
pub struct ClipBatchStatus {
    pub counts: crate::db::clips::ClipStatusCounts,
    pub completed: i64,
    pub total: i64,
    pub composed_video_url: Option<String>,
}

fn internal(e: impl std::fmt::Display) -> Error {
    Error::Internal(e.to_string())
}

/// Regenerate the clip plan for a song from its current analysis
///
/// Deletes prior plan entries and every prior clip that is not yet
/// generated or whose bounds conflict with the new plan. Fails with a
/// precondition error when no analysis exists or the creative inputs
/// (video type, short-form selection) are missing.
pub async fn plan_clips(
    db: &SqlitePool,
    config: &AppConfig,
    event_bus: &muvid_common::events::EventBus,
    song_id: Uuid,
    clip_count: Option<usize>,
    max_clip_sec: Option<f64>,
) -> Result<PlanOutcome> {
    let song = crate::db::songs::get_song(db, song_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| Error::NotFound(format!("song {song_id}")))?;

    let analysis = crate::db::analyses::latest_for_song(db, song_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            Error::Precondition("no analysis exists for this song; run analysis first".to_string())
        })?;

    if song.video_type.is_none() {
        return Err(Error::Precondition(
            "video type must be selected before planning clips".to_string(),
        ));
    }

    let duration = song
        .duration_sec
        .ok_or_else(|| Error::Precondition("song duration not yet known".to_string()))?;

    let window = song.effective_window().ok_or_else(|| {
        Error::Precondition(
            "short-form songs need an audio selection before planning".to_string(),
        )
    })?;
    let window_len = window.1 - window.0;

    if song.video_type == Some(VideoType::ShortForm) && window_len > 30.0 + 1e-9 {
        return Err(Error::InvalidInput(format!(
            "short-form selection is {window_len:.3} s, maximum is 30 s"
        )));
    }

    // Duration bounds; a requested clip count tightens the max bound so
    // the plan lands on that many clips
    let min_clip = config.limits.min_clip_sec;
    let mut max_clip = max_clip_sec
        .unwrap_or(config.limits.max_clip_sec)
        .min(config.limits.max_clip_sec);
    if let Some(count) = clip_count.filter(|&c| c > 0) {
        max_clip = (window_len / count as f64).clamp(min_clip, max_clip);
    }
    if max_clip < min_clip {
        return Err(Error::InvalidInput(format!(
            "max clip duration {max_clip:.2} s is below the minimum {min_clip:.2} s"
        )));
    }

    let params = BeatAlignParams {
        min_clip_sec: min_clip,
        max_clip_sec: max_clip,
        target_fps: config.video.fps,
        selection: Some(window),
    };
    let alignment = align_clips(&analysis.beat_times, duration, &params);

    if alignment.clips.is_empty() {
        return Err(Error::InvalidInput(format!(
            "selection of {window_len:.2} s is too short for clips of at least {min_clip:.1} s"
        )));
    }

    // Build entries and clips; completed clips with matching bounds at
    // the same index survive the replacement
    let prior: Vec<Clip> = crate::db::clips::clips_for_song(db, song_id)
        .await
        .map_err(internal)?;
    let prior_entries = crate::db::plans::entries_for_song(db, song_id)
        .await
        .map_err(internal)?;

    let fallback_section = Section {
        start_sec: window.0,
        end_sec: window.1,
        kind: SectionKind::Unknown,
        confidence: 0.3,
        label: None,
        lyrics: None,
    };

    let mut entries = Vec::new();
    let mut new_clips = Vec::new();
    let mut keep = Vec::new();

    for aligned in &alignment.clips {
        let entry = PlanEntry {
            id: Uuid::new_v4(),
            song_id,
            plan_index: aligned.index as i64,
            start_sec: aligned.start_sec,
            end_sec: aligned.end_sec,
            frame_count: aligned.end_frame - aligned.start_frame,
            target_fps: config.video.fps as i64,
            beat_indices: beat_indices_for(aligned, &analysis.beat_times),
            created_at: Utc::now(),
        };

        // A prior completed clip survives only when the entry at its
        // index kept the same window
        let bounds_match = prior_entries
            .iter()
            .find(|p| p.plan_index == entry.plan_index)
            .map(|p| entry.same_bounds(p.start_sec, p.end_sec))
            .unwrap_or(false);
        let reusable = prior.iter().find(|c| {
            bounds_match
                && c.plan_index == entry.plan_index
                && c.status == ClipStatus::Completed
                && c.requested_frames == entry.frame_count
                && c.requested_fps == entry.target_fps
        });

        if let Some(existing) = reusable {
            keep.push(existing.id);
        } else {
            let midpoint = (aligned.start_sec + aligned.end_sec) / 2.0;
            let section = analysis.section_at(midpoint).unwrap_or(&fallback_section);
            let scene = plan_scene(
                section,
                &analysis,
                &config.prompt_style,
                aligned.duration_sec,
                None,
            );
            new_clips.push(Clip::new(
                song_id,
                entry.plan_index,
                scene.prompt,
                rand::thread_rng().gen_range(0..i64::MAX),
                entry.frame_count,
                config.video.fps as i64,
            ));
        }

        entries.push(entry);
    }

    let mut tx = db.begin().await.map_err(internal)?;
    crate::db::plans::delete_for_song(&mut tx, song_id)
        .await
        .map_err(internal)?;
    crate::db::clips::delete_for_song_except(&mut tx, song_id, &keep)
        .await
        .map_err(internal)?;
    crate::db::plans::insert_entries(&mut tx, &entries)
        .await
        .map_err(internal)?;
    crate::db::clips::insert_clips(&mut tx, &new_clips)
        .await
        .map_err(internal)?;
    tx.commit().await.map_err(internal)?;

    event_bus.emit_lossy(MuvidEvent::ClipPlanReplaced {
        song_id,
        clip_count: entries.len(),
        timestamp: Utc::now(),
    });

    tracing::info!(
        song_id = %song_id,
        clips = entries.len(),
        reused = keep.len(),
        max_alignment_error_ms = format!("{:.1}", alignment.max_alignment_error * 1000.0),
        "Clip plan replaced"
    );

    Ok(PlanOutcome {
        entries,
        clips: new_clips,
        alignment,
        reused: keep.len(),
    })
}

fn beat_indices_for(
    aligned: &crate::planning::AlignedClip,
    beat_times: &[f64],
) -> Vec<usize> {
    beat_times
        .iter()
        .enumerate()
        .filter(|(_, &t)| t > aligned.start_sec && t <= aligned.end_sec + 1e-9)
        .map(|(i, _)| i)
        .collect()
}

/// Enqueue generation for every pending clip of a song
///
/// Returns the batch job handle. Fails when a batch is already running.
pub async fn generate(
    db: &SqlitePool,
    config: &AppConfig,
    song_id: Uuid,
) -> Result<JobRecord> {
    crate::db::songs::get_song(db, song_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| Error::NotFound(format!("song {song_id}")))?;

    let clips = crate::db::clips::clips_for_song(db, song_id)
        .await
        .map_err(internal)?;
    if clips.is_empty() {
        return Err(Error::Precondition(
            "no clip plan exists; plan clips first".to_string(),
        ));
    }

    if let Some(active) = crate::db::jobs::active_batch_for_song(db, song_id)
        .await
        .map_err(internal)?
    {
        return Err(Error::Precondition(format!(
            "clip generation already running (job {})",
            active.id
        )));
    }

    let batch = JobRecord::new(
        config.clip_queue(),
        JobKind::ClipBatch,
        Some(song_id),
        serde_json::to_value(BatchJobPayload { song_id }).map_err(internal)?,
        config.workers.clip_queue_timeout_sec as i64,
    );
    crate::db::jobs::enqueue(db, &batch).await.map_err(internal)?;

    let mut enqueued = 0usize;
    for clip in &clips {
        if !clip.status.is_generatable() {
            continue;
        }
        // Failed and canceled clips re-enter the queue with a clean slate
        if clip.status != ClipStatus::Queued {
            crate::db::clips::reset_for_retry(db, clip.id)
                .await
                .map_err(internal)?;
        }
        enqueue_clip_job(db, config, clip.id, Some(batch.id), None)
            .await
            .map_err(internal)?;
        enqueued += 1;
    }

    if enqueued == 0 {
        return Err(Error::Precondition(
            "no clips are pending generation".to_string(),
        ));
    }

    tracing::info!(song_id = %song_id, batch_job_id = %batch.id, enqueued, "Clip generation batch enqueued");

    Ok(batch)
}

/// Reset a failed or canceled clip to queued and re-enqueue it
pub async fn retry_clip(db: &SqlitePool, config: &AppConfig, clip_id: Uuid) -> Result<Clip> {
    let clip = crate::db::clips::get_clip(db, clip_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| Error::NotFound(format!("clip {clip_id}")))?;

    if !crate::db::clips::reset_for_retry(db, clip_id)
        .await
        .map_err(internal)?
    {
        return Err(Error::Precondition(format!(
            "clip is {}, only failed or canceled clips can be retried",
            clip.status.as_str()
        )));
    }

    enqueue_clip_job(db, config, clip_id, None, None)
        .await
        .map_err(internal)?;

    let refreshed = crate::db::clips::get_clip(db, clip_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| Error::NotFound(format!("clip {clip_id}")))?;

    tracing::info!(clip_id = %clip_id, attempts = refreshed.attempt_count, "Clip reset and re-enqueued");

    Ok(refreshed)
}

/// Aggregate generation status plus the current composed video URL
pub async fn status(db: &SqlitePool, blobs: &BlobStore, song_id: Uuid) -> Result<ClipBatchStatus> {
    let counts = crate::db::clips::status_counts(db, song_id)
        .await
        .map_err(internal)?;

    let composed_video_url = crate::db::composed_videos::latest_for_song(db, song_id)
        .await
        .map_err(internal)?
        .map(|video| blobs.read_url(&video.blob_key, Duration::from_secs(900)));

    Ok(ClipBatchStatus {
        completed: counts.completed,
        total: counts.total,
        counts,
        composed_video_url,
    })
}

/// Request cancellation of a batch generation job and its clips
pub async fn cancel_batch(ctx: &WorkerContext, batch_job_id: Uuid) -> Result<()> {
    let job = crate::db::jobs::get_job(&ctx.db, batch_job_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| Error::NotFound(format!("job {batch_job_id}")))?;

    if job.kind != JobKind::ClipBatch {
        return Err(Error::InvalidInput(format!(
            "job {batch_job_id} is not a clip generation batch"
        )));
    }

    let song_id = job.song_id.ok_or_else(|| {
        Error::Internal("batch job has no song id".to_string())
    })?;

    crate::db::jobs::request_cancel(&ctx.db, batch_job_id)
        .await
        .map_err(internal)?;

    // New clips stop being dequeued immediately
    let canceled_clips = crate::db::clips::cancel_queued_for_song(&ctx.db, song_id)
        .await
        .map_err(internal)?;
    let clip_jobs = crate::db::jobs::cancel_clip_jobs_for_song(&ctx.db, song_id)
        .await
        .map_err(internal)?;

    // Wake any in-process workers promptly
    ctx.cancellations.cancel(batch_job_id).await;
    for job_id in &clip_jobs {
        ctx.cancellations.cancel(*job_id).await;
    }

    tracing::info!(
        batch_job_id = %batch_job_id,
        song_id = %song_id,
        canceled_clips,
        clip_jobs = clip_jobs.len(),
        "Batch cancellation requested"
    );

    Ok(())
}

async fn enqueue_clip_job(
    db: &SqlitePool,
    config: &AppConfig,
    clip_id: Uuid,
    batch_job_id: Option<Uuid>,
    delay: Option<Duration>,
) -> anyhow::Result<()> {
    let clip = crate::db::clips::get_clip(db, clip_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("clip {clip_id} vanished"))?;

    let mut job = JobRecord::new(
        config.clip_queue(),
        JobKind::ClipGenerate,
        Some(clip.song_id),
        serde_json::to_value(ClipJobPayload {
            clip_id,
            batch_job_id,
        })?,
        config.workers.clip_queue_timeout_sec as i64,
    );
    if let Some(delay) = delay {
        job = job.with_delay(delay);
    }
    crate::db::jobs::enqueue(db, &job).await?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Worker-side job execution
// ----------------------------------------------------------------------------

use crate::clips::generator_client::{GenerationRequest, GenerationStatus, GeneratorError};

/// Execute one per-clip generation job
///
/// At most one active generation per clip id: the claim is a CAS from
/// queued to processing, and losers drop the job. The per-song cap is
/// enforced at claim time; over-cap claims release with a jittered delay
/// to avoid a re-dequeue stampede.
pub async fn run_clip_job(
    ctx: &WorkerContext,
    job: &JobRecord,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let payload: ClipJobPayload = serde_json::from_value(job.payload.clone())?;
    let clip_id = payload.clip_id;

    let Some(clip) = crate::db::clips::get_clip(&ctx.db, clip_id).await? else {
        // Plan was replaced underneath us; nothing to do
        crate::db::jobs::mark_completed(&ctx.db, job.id).await?;
        return Ok(());
    };

    // Cancellation requested before we even started
    if batch_canceling(ctx, payload.batch_job_id).await || ctx.cancel_requested(job.id, token).await
    {
        crate::db::clips::mark_canceled(&ctx.db, clip_id).await?;
        crate::db::jobs::mark_canceled(&ctx.db, job.id).await?;
        emit_clip_status(ctx, &clip, ClipStatus::Canceled);
        return Ok(());
    }

    // Pre-claim cap check keeps the processing count from ever exceeding
    // the cap at a sampled instant
    let cap = ctx.config.workers.worker_concurrency_per_song as i64;
    if crate::db::clips::count_processing_for_song(&ctx.db, clip.song_id).await? >= cap {
        defer_over_cap(ctx, job, clip_id, payload.batch_job_id).await?;
        return Ok(());
    }

    // Claim: queued -> processing (attempt + 1). Losing means another
    // worker holds this clip, or it reached a terminal state.
    if !crate::db::clips::claim_for_processing(&ctx.db, clip_id).await? {
        crate::db::jobs::mark_completed(&ctx.db, job.id).await?;
        return Ok(());
    }

    // Post-claim double check closes the claim race
    if crate::db::clips::count_processing_for_song(&ctx.db, clip.song_id).await? > cap {
        crate::db::clips::release_to_queued(&ctx.db, clip_id).await?;
        defer_over_cap(ctx, job, clip_id, payload.batch_job_id).await?;
        return Ok(());
    }

    let clip = crate::db::clips::get_clip(&ctx.db, clip_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("clip {clip_id} vanished after claim"))?;
    emit_clip_status(ctx, &clip, ClipStatus::Processing);

    let Some(generator) = ctx.generator.clone() else {
        let message = "no video generator endpoint configured";
        crate::db::clips::mark_failed(&ctx.db, clip_id, message).await?;
        crate::db::jobs::mark_failed(&ctx.db, job.id, message).await?;
        emit_clip_status(ctx, &clip, ClipStatus::Failed);
        return Ok(());
    };

    // Submit, unless a provider job already exists (worker restart
    // mid-poll resumes instead of resubmitting)
    let external_id = match clip.external_job_id.clone() {
        Some(id) => id,
        None => {
            let song = crate::db::songs::get_song(&ctx.db, clip.song_id).await?;
            let reference_image_url = song.and_then(|s| s.character_image_key).map(|key| {
                ctx.blobs.read_url(
                    &key,
                    Duration::from_secs(ctx.config.generation.wall_clock_cap_sec),
                )
            });
            let request = GenerationRequest {
                prompt: clip.prompt.clone(),
                frames: clip.requested_frames,
                fps: clip.requested_fps,
                seed: Some(clip.seed),
                reference_image_url,
                idempotency_key: GenerationRequest::idempotency_key(
                    clip_id,
                    clip.attempt_count,
                ),
            };

            match generator.submit(&request).await {
                Ok(id) => {
                    crate::db::clips::set_external_job(&ctx.db, clip_id, &id).await?;
                    id
                }
                Err(GeneratorError::Permanent(message)) => {
                    fail_clip(ctx, job, &clip, &message).await?;
                    return Ok(());
                }
                Err(e) => {
                    retriable_failure(ctx, job, &clip, payload.batch_job_id, &e.to_string())
                        .await?;
                    return Ok(());
                }
            }
        }
    };

    poll_generation(ctx, job, &clip, &external_id, payload.batch_job_id, token, &*generator)
        .await
}

/// Poll the provider until success, failure, timeout or cancellation
async fn poll_generation(
    ctx: &WorkerContext,
    job: &JobRecord,
    clip: &Clip,
    external_id: &str,
    batch_job_id: Option<Uuid>,
    token: &CancellationToken,
    generator: &dyn crate::clips::generator_client::VideoGenerator,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(ctx.config.generation.wall_clock_cap_sec);
    let poll_interval = Duration::from_secs(ctx.config.generation.poll_interval_sec.max(1));
    let mut transient_polls = 0u32;

    loop {
        // Checkpoint before every external poll
        if batch_canceling(ctx, batch_job_id).await || ctx.cancel_requested(job.id, token).await {
            crate::db::clips::mark_canceled(&ctx.db, clip.id).await?;
            crate::db::jobs::mark_canceled(&ctx.db, job.id).await?;
            emit_clip_status(ctx, clip, ClipStatus::Canceled);
            tracing::info!(clip_id = %clip.id, "Clip generation canceled at poll checkpoint");
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            // First two attempts retry a timeout; afterwards it is fatal
            let message = format!(
                "generation timed out after {} s",
                ctx.config.generation.wall_clock_cap_sec
            );
            if clip.attempt_count <= 2 {
                retriable_failure(ctx, job, clip, batch_job_id, &message).await?;
            } else {
                fail_clip(ctx, job, clip, &message).await?;
            }
            return Ok(());
        }

        match generator.poll(external_id).await {
            Ok(GenerationStatus::Starting) | Ok(GenerationStatus::Processing) => {
                tokio::time::sleep(poll_interval).await;
            }
            Ok(GenerationStatus::Succeeded {
                result_url,
                width,
                height,
                fps,
            }) => {
                return finish_clip(ctx, job, clip, &result_url, width, height, fps).await;
            }
            Ok(GenerationStatus::Failed { message, retriable }) => {
                if retriable {
                    retriable_failure(ctx, job, clip, batch_job_id, &message).await?;
                } else {
                    fail_clip(ctx, job, clip, &message).await?;
                }
                return Ok(());
            }
            Err(GeneratorError::NotFound(message)) => {
                // Provider lost the job; resubmitting on a fresh attempt
                // is the only way forward
                retriable_failure(
                    ctx,
                    job,
                    clip,
                    batch_job_id,
                    &format!("provider job disappeared: {message}"),
                )
                .await?;
                return Ok(());
            }
            Err(GeneratorError::Permanent(message)) => {
                fail_clip(ctx, job, clip, &message).await?;
                return Ok(());
            }
            Err(GeneratorError::Transient(message)) => {
                transient_polls += 1;
                if transient_polls >= ctx.config.retry.max_attempts * 3 {
                    retriable_failure(ctx, job, clip, batch_job_id, &message).await?;
                    return Ok(());
                }
                tracing::warn!(clip_id = %clip.id, error = %message, "Transient poll failure");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

/// Verify the result against the completion invariant and complete
async fn finish_clip(
    ctx: &WorkerContext,
    job: &JobRecord,
    clip: &Clip,
    result_url: &str,
    width: Option<i64>,
    height: Option<i64>,
    fps: Option<f64>,
) -> anyhow::Result<()> {
    // Completed iff the result is fetchable and its duration matches the
    // request within one frame
    match crate::compose::ffmpeg::probe(&ctx.config.encoder, result_url).await {
        Ok(info) => {
            if !clip.duration_within_tolerance(info.duration_sec) {
                let message = format!(
                    "result duration {:.3} s outside tolerance of requested {:.3} s",
                    info.duration_sec,
                    clip.requested_duration_sec()
                );
                retriable_failure(ctx, job, clip, None, &message).await?;
                return Ok(());
            }

            crate::db::clips::mark_completed(
                &ctx.db,
                clip.id,
                result_url,
                width.or(Some(info.width)),
                height.or(Some(info.height)),
                fps.or(Some(info.fps)),
            )
            .await?;
            crate::db::jobs::mark_completed(&ctx.db, job.id).await?;
            emit_clip_status(ctx, clip, ClipStatus::Completed);
            tracing::info!(
                clip_id = %clip.id,
                attempts = clip.attempt_count,
                "Clip generation completed"
            );
            Ok(())
        }
        Err(e) => {
            retriable_failure(
                ctx,
                job,
                clip,
                None,
                &format!("result verification failed: {e}"),
            )
            .await?;
            Ok(())
        }
    }
}

/// Over-cap deferral: release and come back after a jittered delay
async fn defer_over_cap(
    ctx: &WorkerContext,
    job: &JobRecord,
    clip_id: Uuid,
    batch_job_id: Option<Uuid>,
) -> anyhow::Result<()> {
    let jitter_ms = rand::thread_rng().gen_range(500..2000);
    enqueue_clip_job(
        &ctx.db,
        &ctx.config,
        clip_id,
        batch_job_id,
        Some(Duration::from_millis(jitter_ms)),
    )
    .await?;
    crate::db::jobs::mark_completed(&ctx.db, job.id).await?;
    tracing::debug!(clip_id = %clip_id, jitter_ms, "Per-song cap reached, deferred");
    Ok(())
}

/// Retriable failure: requeue under the backoff policy or promote to
/// fatal once attempts are exhausted
async fn retriable_failure(
    ctx: &WorkerContext,
    job: &JobRecord,
    clip: &Clip,
    batch_job_id: Option<Uuid>,
    message: &str,
) -> anyhow::Result<()> {
    if clip.attempt_count < ctx.config.retry.max_attempts as i64 {
        let delay = ctx
            .config
            .retry
            .backoff_for_attempt(clip.attempt_count as u32);
        crate::db::clips::requeue_for_retry(&ctx.db, clip.id, message).await?;
        enqueue_clip_job(&ctx.db, &ctx.config, clip.id, batch_job_id, Some(delay)).await?;
        crate::db::jobs::mark_completed(&ctx.db, job.id).await?;
        emit_clip_status(ctx, clip, ClipStatus::Queued);
        tracing::warn!(
            clip_id = %clip.id,
            attempt = clip.attempt_count,
            delay_sec = delay.as_secs_f64(),
            error = %message,
            "Clip attempt failed, retrying with backoff"
        );
    } else {
        fail_clip(ctx, job, clip, message).await?;
    }
    Ok(())
}

async fn fail_clip(
    ctx: &WorkerContext,
    job: &JobRecord,
    clip: &Clip,
    message: &str,
) -> anyhow::Result<()> {
    crate::db::clips::mark_failed(&ctx.db, clip.id, message).await?;
    crate::db::jobs::mark_failed(&ctx.db, job.id, message).await?;
    emit_clip_status(ctx, clip, ClipStatus::Failed);
    tracing::error!(
        clip_id = %clip.id,
        attempts = clip.attempt_count,
        error = %message,
        "Clip generation failed"
    );
    Ok(())
}

async fn batch_canceling(ctx: &WorkerContext, batch_job_id: Option<Uuid>) -> bool {
    match batch_job_id {
        Some(id) => crate::db::jobs::is_canceling(&ctx.db, id).await.unwrap_or(false),
        None => false,
    }
}

fn emit_clip_status(ctx: &WorkerContext, clip: &Clip, status: ClipStatus) {
    ctx.event_bus.emit_lossy(MuvidEvent::ClipStatusChanged {
        song_id: clip.song_id,
        clip_id: clip.id,
        plan_index: clip.plan_index,
        status: status.as_str().to_string(),
        timestamp: Utc::now(),
    });
}

/// Execute the batch monitor job: aggregate progress until every clip is
/// terminal, honoring cancellation
pub async fn run_batch_job(
    ctx: &WorkerContext,
    job: &JobRecord,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let payload: BatchJobPayload = serde_json::from_value(job.payload.clone())?;
    let song_id = payload.song_id;

    loop {
        if ctx.cancel_requested(job.id, token).await {
            // Stop dequeueing new clips; in-flight ones observe the
            // canceling batch at their next checkpoint
            crate::db::clips::cancel_queued_for_song(&ctx.db, song_id).await?;
            crate::db::jobs::cancel_clip_jobs_for_song(&ctx.db, song_id).await?;
            crate::db::jobs::mark_canceled(&ctx.db, job.id).await?;
            ctx.event_bus.emit_lossy(MuvidEvent::JobCanceled {
                job_id: job.id,
                kind: "clip_batch".to_string(),
                timestamp: Utc::now(),
            });
            tracing::info!(song_id = %song_id, "Batch generation canceled");
            return Ok(());
        }

        let counts = crate::db::clips::status_counts(&ctx.db, song_id).await?;
        let terminal = counts.completed + counts.failed + counts.canceled;

        if counts.total > 0 {
            let percent = terminal as f64 / counts.total as f64 * 100.0;
            crate::db::jobs::set_progress(&ctx.db, job.id, percent).await?;
            ctx.event_bus.emit_lossy(MuvidEvent::ClipBatchProgress {
                song_id,
                job_id: job.id,
                completed: counts.completed as usize,
                failed: counts.failed as usize,
                total: counts.total as usize,
                timestamp: Utc::now(),
            });
        }

        if counts.total == 0 || terminal == counts.total {
            if counts.failed > 0 {
                crate::db::jobs::mark_failed(
                    &ctx.db,
                    job.id,
                    &format!("{} of {} clips failed", counts.failed, counts.total),
                )
                .await?;
            } else {
                crate::db::jobs::mark_completed(&ctx.db, job.id).await?;
            }
            tracing::info!(
                song_id = %song_id,
                completed = counts.completed,
                failed = counts.failed,
                total = counts.total,
                "Batch generation finished"
            );
            return Ok(());
        }

        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }
    }
}
