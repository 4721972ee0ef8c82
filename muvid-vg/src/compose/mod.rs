//! Composition engine
//!
//! Assembles completed clips plus the original audio into the final
//! artifact through a persisted state machine:
//! queued -> validating -> downloading -> normalizing -> beat_aligning?
//! -> concatenating -> applying_effects? -> muxing -> verifying ->
//! uploading -> completed. Cancellation is honored at every subprocess
//! boundary and between per-clip normalizations; intermediate files are
//! cleaned up on every exit path.

pub mod effects;
pub mod ffmpeg;

use crate::config::AppConfig;
use crate::models::{
    Clip, ClipStatus, ComposedVideo, CompositionJob, CompositionState, JobKind, JobRecord,
    PlanEntry,
};
use crate::queue::WorkerContext;
use anyhow::Context;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use muvid_common::events::MuvidEvent;
use muvid_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Payload of a composition job: the target row plus the config
/// snapshot the worker must use, so one job sees one consistent config
#[derive(Debug, Serialize, Deserialize)]
pub struct ComposePayload {
    pub composition_job_id: Uuid,
    pub config: AppConfig,
}

fn internal(e: impl std::fmt::Display) -> Error {
    Error::Internal(e.to_string())
}

/// Enqueue composition of a song's completed clips
///
/// Preconditions: a plan exists, every planned clip is completed, and no
/// other composition is active for the song.
pub async fn enqueue_composition(
    db: &SqlitePool,
    config: &AppConfig,
    song_id: Uuid,
) -> Result<(CompositionJob, JobRecord)> {
    let song = crate::db::songs::get_song(db, song_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| Error::NotFound(format!("song {song_id}")))?;

    song.effective_window().ok_or_else(|| {
        Error::Precondition("video type and selection must be set before composing".to_string())
    })?;

    let entries = crate::db::plans::entries_for_song(db, song_id)
        .await
        .map_err(internal)?;
    if entries.is_empty() {
        return Err(Error::Precondition(
            "no clip plan exists; plan and generate clips first".to_string(),
        ));
    }

    let clips = crate::db::clips::clips_for_song(db, song_id)
        .await
        .map_err(internal)?;
    let incomplete: Vec<i64> = clips
        .iter()
        .filter(|c| c.status != ClipStatus::Completed)
        .map(|c| c.plan_index)
        .collect();
    if clips.len() != entries.len() || !incomplete.is_empty() {
        return Err(Error::Precondition(format!(
            "composition requires every planned clip completed; pending indices: {incomplete:?}"
        )));
    }

    if let Some(active) = crate::db::compositions::active_for_song(db, song_id)
        .await
        .map_err(internal)?
    {
        return Err(Error::Precondition(format!(
            "composition {} is already running for this song",
            active.id
        )));
    }

    let composition = CompositionJob::new(song_id, clips.iter().map(|c| c.id).collect());
    crate::db::compositions::insert_job(db, &composition)
        .await
        .map_err(internal)?;

    let job = JobRecord::new(
        config.default_queue(),
        JobKind::Compose,
        Some(song_id),
        serde_json::to_value(ComposePayload {
            composition_job_id: composition.id,
            config: config.clone(),
        })
        .map_err(internal)?,
        config.workers.composition_timeout_sec as i64,
    );
    crate::db::jobs::enqueue(db, &job).await.map_err(internal)?;

    tracing::info!(
        song_id = %song_id,
        composition_id = %composition.id,
        job_id = %job.id,
        clips = clips.len(),
        "Composition enqueued"
    );

    Ok((composition, job))
}

/// Internal step outcome
enum StepOutcome {
    Canceled,
    Failed(String),
}

impl From<anyhow::Error> for StepOutcome {
    fn from(e: anyhow::Error) -> Self {
        StepOutcome::Failed(format!("{e:#}"))
    }
}

impl From<ffmpeg::EncoderError> for StepOutcome {
    fn from(e: ffmpeg::EncoderError) -> Self {
        StepOutcome::Failed(e.to_string())
    }
}

/// Execute one composition job
pub async fn run_composition_job(
    ctx: &WorkerContext,
    job: &JobRecord,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let payload: ComposePayload = serde_json::from_value(job.payload.clone())?;
    let config = payload.config;

    let Some(composition) =
        crate::db::compositions::get_job(&ctx.db, payload.composition_job_id).await?
    else {
        crate::db::jobs::mark_failed(&ctx.db, job.id, "composition row missing").await?;
        return Ok(());
    };

    if composition.state.is_terminal() {
        crate::db::jobs::mark_completed(&ctx.db, job.id).await?;
        return Ok(());
    }

    let temp_dir = config.temp_root().join(composition.id.to_string());
    tokio::fs::create_dir_all(&temp_dir).await?;

    let result = compose(ctx, &config, job, &composition, &temp_dir, token).await;

    // Intermediates never outlive the job, whatever the outcome
    if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
        tracing::warn!(path = %temp_dir.display(), error = %e, "Failed to remove composition temp dir");
    }

    match result {
        Ok(video) => {
            crate::db::compositions::set_state(&ctx.db, composition.id, CompositionState::Completed)
                .await?;
            crate::db::jobs::mark_completed(&ctx.db, job.id).await?;
            ctx.event_bus.emit_lossy(MuvidEvent::CompositionCompleted {
                song_id: composition.song_id,
                job_id: job.id,
                composed_video_id: video.id,
                duration_sec: video.duration_sec,
                timestamp: Utc::now(),
            });
            tracing::info!(
                composition_id = %composition.id,
                composed_video_id = %video.id,
                duration_sec = video.duration_sec,
                bytes = video.byte_size,
                "Composition completed"
            );
        }
        Err(StepOutcome::Canceled) => {
            crate::db::compositions::mark_canceled(&ctx.db, composition.id).await?;
            crate::db::jobs::mark_canceled(&ctx.db, job.id).await?;
            ctx.event_bus.emit_lossy(MuvidEvent::JobCanceled {
                job_id: job.id,
                kind: "compose".to_string(),
                timestamp: Utc::now(),
            });
            tracing::info!(composition_id = %composition.id, "Composition canceled");
        }
        Err(StepOutcome::Failed(error)) => {
            crate::db::compositions::mark_failed(&ctx.db, composition.id, &error).await?;
            crate::db::jobs::mark_failed(&ctx.db, job.id, &error).await?;
            ctx.event_bus.emit_lossy(MuvidEvent::CompositionFailed {
                song_id: composition.song_id,
                job_id: job.id,
                error: error.clone(),
                timestamp: Utc::now(),
            });
            tracing::error!(composition_id = %composition.id, error = %error, "Composition failed");
        }
    }

    Ok(())
}

/// Checkpoint probe combining the job row, the composition row and the
/// in-process token
async fn canceled(
    ctx: &WorkerContext,
    job_id: Uuid,
    composition_id: Uuid,
    token: &CancellationToken,
) -> bool {
    if ctx.cancel_requested(job_id, token).await {
        return true;
    }
    crate::db::compositions::cancel_requested(&ctx.db, composition_id)
        .await
        .unwrap_or(false)
}

async fn advance(
    ctx: &WorkerContext,
    job: &JobRecord,
    composition: &CompositionJob,
    state: CompositionState,
    token: &CancellationToken,
) -> std::result::Result<(), StepOutcome> {
    if canceled(ctx, job.id, composition.id, token).await {
        return Err(StepOutcome::Canceled);
    }

    crate::db::compositions::set_state(&ctx.db, composition.id, state)
        .await
        .map_err(|e| StepOutcome::Failed(e.to_string()))?;
    crate::db::jobs::set_progress(&ctx.db, job.id, state.progress_percent())
        .await
        .map_err(|e| StepOutcome::Failed(e.to_string()))?;
    ctx.event_bus.emit_lossy(MuvidEvent::CompositionProgress {
        song_id: composition.song_id,
        job_id: job.id,
        state: state.as_str().to_string(),
        percent: state.progress_percent(),
        timestamp: Utc::now(),
    });

    Ok(())
}

async fn compose(
    ctx: &WorkerContext,
    config: &AppConfig,
    job: &JobRecord,
    composition: &CompositionJob,
    temp_dir: &Path,
    token: &CancellationToken,
) -> std::result::Result<ComposedVideo, StepOutcome> {
    let song = crate::db::songs::get_song(&ctx.db, composition.song_id)
        .await
        .context("loading song")?
        .ok_or_else(|| StepOutcome::Failed("song vanished".to_string()))?;
    let entries = crate::db::plans::entries_for_song(&ctx.db, composition.song_id)
        .await
        .context("loading plan")?;
    let analysis = crate::db::analyses::latest_for_song(&ctx.db, composition.song_id)
        .await
        .context("loading analysis")?;

    let window = song
        .effective_window()
        .ok_or_else(|| StepOutcome::Failed("song has no effective window".to_string()))?;
    let selected_len = window.1 - window.0;
    let fps = config.video.fps as f64;
    let frame = 1.0 / fps;
    let eps = 2.0 * frame;

    let mut clips: Vec<Clip> = Vec::with_capacity(composition.clip_ids.len());
    for clip_id in &composition.clip_ids {
        let clip = crate::db::clips::get_clip(&ctx.db, *clip_id)
            .await
            .context("loading clip")?
            .ok_or_else(|| StepOutcome::Failed(format!("clip {clip_id} vanished")))?;
        if clip.status != ClipStatus::Completed || clip.result_url.is_none() {
            return Err(StepOutcome::Failed(format!(
                "clip {} is {} and cannot be composed",
                clip.plan_index,
                clip.status.as_str()
            )));
        }
        clips.push(clip);
    }
    clips.sort_by_key(|c| c.plan_index);

    // Validating: probe every clip, then check the duration envelope
    advance(ctx, job, composition, CompositionState::Validating, token).await?;

    if selected_len > config.limits.max_song_duration_sec {
        return Err(StepOutcome::Failed(format!(
            "selected duration {selected_len:.1} s exceeds the {:.0} s cap",
            config.limits.max_song_duration_sec
        )));
    }

    let mut total = 0.0f64;
    for clip in &clips {
        if canceled(ctx, job.id, composition.id, token).await {
            return Err(StepOutcome::Canceled);
        }
        let url = clip
            .result_url
            .as_deref()
            .ok_or_else(|| StepOutcome::Failed(format!("clip {} lost its result", clip.plan_index)))?;
        let info = ffmpeg::probe(&config.encoder, url)
            .await
            .map_err(|e| StepOutcome::Failed(format!("clip {} unreadable: {e}", clip.plan_index)))?;
        total += info.duration_sec;
    }

    if total > selected_len + config.limits.max_extend_sec {
        return Err(StepOutcome::Failed(format!(
            "clips total {total:.2} s but the selection is {selected_len:.2} s; \
             overshoot exceeds the {:.1} s extension budget",
            config.limits.max_extend_sec
        )));
    }
    if total < selected_len - eps && selected_len - total > config.limits.max_extend_sec {
        return Err(StepOutcome::Failed(format!(
            "clips total {total:.2} s, short of the {selected_len:.2} s selection by more than \
             the {:.1} s extension budget",
            config.limits.max_extend_sec
        )));
    }

    // Downloading: clips then source audio, abortable between files
    advance(ctx, job, composition, CompositionState::Downloading, token).await?;

    let mut raw_paths: Vec<PathBuf> = Vec::with_capacity(clips.len());
    for (i, clip) in clips.iter().enumerate() {
        if canceled(ctx, job.id, composition.id, token).await {
            return Err(StepOutcome::Canceled);
        }
        let dest = temp_dir.join(format!("clip_{i}.mp4"));
        let url = clip
            .result_url
            .as_deref()
            .ok_or_else(|| StepOutcome::Failed(format!("clip {} lost its result", clip.plan_index)))?;
        fetch_to_file(url, &dest).await.map_err(|e| {
            StepOutcome::Failed(format!("downloading clip {}: {e:#}", clip.plan_index))
        })?;
        raw_paths.push(dest);
    }

    let audio_ext = song
        .source_blob_key
        .rsplit('.')
        .next()
        .unwrap_or("bin")
        .to_string();
    let audio_path = temp_dir.join(format!("audio.{audio_ext}"));
    let audio_bytes = ctx
        .blobs
        .get(&song.source_blob_key)
        .await
        .context("fetching source audio")?;
    tokio::fs::write(&audio_path, &audio_bytes)
        .await
        .context("writing audio temp file")?;

    // Normalizing: bounded parallel, checkpoint between completions
    advance(ctx, job, composition, CompositionState::Normalizing, token).await?;

    let norm_paths: Vec<PathBuf> = (0..raw_paths.len())
        .map(|i| temp_dir.join(format!("norm_{i}.mp4")))
        .collect();

    let mut normalize_stream = stream::iter(
        raw_paths
            .clone()
            .into_iter()
            .zip(norm_paths.clone().into_iter())
            .enumerate(),
    )
        .map(|(i, (input, output))| {
            let encoder = config.encoder.clone();
            let video = config.video.clone();
            async move {
                let result = ffmpeg::normalize(&encoder, &video, &input, &output).await;
                (i, result)
            }
        })
        .buffer_unordered(config.workers.normalize_workers.max(1));

    let mut normalized = 0usize;
    while let Some((i, result)) = normalize_stream.next().await {
        result.map_err(|e| StepOutcome::Failed(format!("normalizing clip {i}: {e}")))?;
        normalized += 1;

        let percent = CompositionState::Normalizing.progress_percent()
            + 25.0 * normalized as f64 / norm_paths.len() as f64;
        let _ = crate::db::compositions::set_progress(&ctx.db, composition.id, percent).await;
        let _ = crate::db::jobs::set_progress(&ctx.db, job.id, percent).await;

        if canceled(ctx, job.id, composition.id, token).await {
            return Err(StepOutcome::Canceled);
        }
    }
    drop(normalize_stream);

    // Beat-aligned trim/extend toward the planned durations
    if config.beat_aligned_transitions_enabled {
        advance(ctx, job, composition, CompositionState::BeatAligning, token).await?;
        beat_align_clips(config, &entries, &norm_paths, temp_dir, frame).await?;
    }

    // Concatenating via the stream-copy demuxer
    advance(ctx, job, composition, CompositionState::Concatenating, token).await?;

    let list_path = temp_dir.join("concat.txt");
    let list_body: String = norm_paths
        .iter()
        .map(|p| format!("file '{}'\n", p.display()))
        .collect();
    tokio::fs::write(&list_path, list_body)
        .await
        .context("writing concat list")?;

    let joined = temp_dir.join("joined.mp4");
    ffmpeg::concat(&config.encoder, &list_path, &joined).await?;

    // Beat effects keyed on beat frames within the selection
    let mut current = joined;
    if config.beat_effect.enabled {
        advance(ctx, job, composition, CompositionState::ApplyingEffects, token).await?;

        let beat_times = analysis.as_ref().map(|a| a.beat_times.as_slice()).unwrap_or(&[]);
        let frames = effects::beat_frames(beat_times, window.0, selected_len, config.video.fps);
        if let Some(filter) = effects::build_filter(&config.beat_effect, &frames, &config.video) {
            let effected = temp_dir.join("effected.mp4");
            ffmpeg::apply_filter(&config.encoder, &config.video, &current, &effected, &filter)
                .await?;
            current = effected;
        } else {
            tracing::debug!("No beats in window, skipping beat effects");
        }
    }

    // Muxing: pad the visuals into the selection length if the shortfall
    // fits the extension budget, then cut both tracks at the selection
    advance(ctx, job, composition, CompositionState::Muxing, token).await?;

    let video_info = ffmpeg::probe(&config.encoder, &current.to_string_lossy()).await?;
    if video_info.duration_sec < selected_len - eps {
        let shortfall = selected_len - video_info.duration_sec;
        if shortfall > config.limits.max_extend_sec {
            return Err(StepOutcome::Failed(format!(
                "visual track is {shortfall:.2} s short of the selection, beyond the \
                 {:.1} s extension budget",
                config.limits.max_extend_sec
            )));
        }
        let extended = temp_dir.join("extended.mp4");
        ffmpeg::extend_freeze(
            &config.encoder,
            &config.video,
            &current,
            &extended,
            video_info.duration_sec,
            selected_len,
            0.25,
        )
        .await?;
        current = extended;
    }

    let output = temp_dir.join("composed.mp4");
    ffmpeg::mux(
        &config.encoder,
        &current,
        &audio_path,
        &output,
        window.0,
        selected_len,
    )
    .await?;

    // Verifying the final artifact against the target parameters
    advance(ctx, job, composition, CompositionState::Verifying, token).await?;

    let final_info = ffmpeg::probe(&config.encoder, &output.to_string_lossy()).await?;
    if final_info.width != config.video.width as i64
        || final_info.height != config.video.height as i64
    {
        return Err(StepOutcome::Failed(format!(
            "output resolution {}x{} does not match target {}x{}",
            final_info.width, final_info.height, config.video.width, config.video.height
        )));
    }
    if (final_info.fps - fps).abs() > 0.1 {
        return Err(StepOutcome::Failed(format!(
            "output fps {:.3} does not match target {fps}",
            final_info.fps
        )));
    }
    if (final_info.duration_sec - selected_len).abs() > frame {
        return Err(StepOutcome::Failed(format!(
            "output duration {:.3} s differs from the selection {selected_len:.3} s by more \
             than one frame",
            final_info.duration_sec
        )));
    }

    // Uploading: blob first, then the record, so a crash between the two
    // leaves only a sweepable orphan blob
    advance(ctx, job, composition, CompositionState::Uploading, token).await?;

    let bytes = tokio::fs::read(&output).await.context("reading output")?;
    let video_id = Uuid::new_v4();
    let blob_key = crate::storage::BlobStore::composed_key(video_id);
    ctx.blobs
        .put(&blob_key, &bytes)
        .await
        .context("uploading composed video")?;

    let video = ComposedVideo {
        id: video_id,
        song_id: composition.song_id,
        blob_key,
        width: final_info.width,
        height: final_info.height,
        fps: final_info.fps,
        duration_sec: final_info.duration_sec,
        byte_size: bytes.len() as i64,
        composition_job_id: composition.id,
        clip_ids: composition.clip_ids.clone(),
        created_at: Utc::now(),
    };
    crate::db::composed_videos::insert_video(&ctx.db, &video)
        .await
        .context("recording composed video")?;

    Ok(video)
}

/// Trim or freeze-extend each normalized clip to its planned duration
async fn beat_align_clips(
    config: &AppConfig,
    entries: &[PlanEntry],
    norm_paths: &[PathBuf],
    temp_dir: &Path,
    frame: f64,
) -> std::result::Result<(), StepOutcome> {
    for (i, path) in norm_paths.iter().enumerate() {
        let Some(entry) = entries.get(i) else { break };
        let planned = entry.duration_sec();

        let info = ffmpeg::probe(&config.encoder, &path.to_string_lossy()).await?;
        let drift = info.duration_sec - planned;

        if drift > frame / 2.0 {
            let trimmed = temp_dir.join(format!("trim_{i}.mp4"));
            ffmpeg::trim(&config.encoder, path, &trimmed, planned).await?;
            tokio::fs::rename(&trimmed, path)
                .await
                .context("replacing trimmed clip")?;
        } else if drift < -frame / 2.0 {
            let extended = temp_dir.join(format!("ext_{i}.mp4"));
            ffmpeg::extend_freeze(
                &config.encoder,
                &config.video,
                path,
                &extended,
                info.duration_sec,
                planned,
                0.25,
            )
            .await?;
            tokio::fs::rename(&extended, path)
                .await
                .context("replacing extended clip")?;
        }
    }
    Ok(())
}

/// Fetch a clip result to a local file
///
/// Generator results are normally https URLs; bare paths (mirrored or
/// locally generated results) are copied.
async fn fetch_to_file(source: &str, dest: &Path) -> anyhow::Result<()> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::get(source).await?.error_for_status()?;
        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
    } else {
        tokio::fs::copy(source, dest).await?;
    }
    Ok(())
}
