//! Audio analysis engine
//!
//! Drives one analysis job end to end: decode, beat tracking, section
//! inference (external service first, internal segmenter as fallback),
//! mood and genre, optional lyrics, waveform summary. Persists one
//! SongAnalysis record and publishes milestone progress (25/50/70/85/100).

pub mod beats;
pub mod decode;
pub mod lyrics;
pub mod mood;
pub mod sections;
pub mod spectral;
pub mod waveform;

use crate::config::RetryPolicy;
use crate::models::{AnalysisState, JobRecord, Section, SongAnalysis};
use crate::queue::WorkerContext;
use anyhow::{Context, Result};
use chrono::Utc;
use muvid_common::events::MuvidEvent;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sections::{StructureClient, StructureError};

/// Run one analysis job to completion, failure, or cancellation
pub async fn run_analysis_job(
    ctx: &WorkerContext,
    job: &JobRecord,
    token: &CancellationToken,
) -> Result<()> {
    let song_id = job.song_id.context("analysis job missing song id")?;

    let song = crate::db::songs::get_song(&ctx.db, song_id)
        .await?
        .context("song not found")?;

    crate::db::songs::set_analysis_state(&ctx.db, song_id, AnalysisState::Processing).await?;
    ctx.event_bus.emit_lossy(MuvidEvent::AnalysisStarted {
        song_id,
        job_id: job.id,
        timestamp: Utc::now(),
    });

    match analyze(ctx, job, &song, token).await {
        Ok(analysis) => {
            crate::db::songs::set_analysis_state(&ctx.db, song_id, AnalysisState::Completed)
                .await?;
            crate::db::jobs::mark_completed(&ctx.db, job.id).await?;
            ctx.event_bus.emit_lossy(MuvidEvent::AnalysisCompleted {
                song_id,
                job_id: job.id,
                bpm: analysis.bpm,
                section_count: analysis.sections.len(),
                timestamp: Utc::now(),
            });
            tracing::info!(
                song_id = %song_id,
                job_id = %job.id,
                bpm = ?analysis.bpm,
                sections = analysis.sections.len(),
                beats = analysis.beat_times.len(),
                "Analysis completed"
            );
            Ok(())
        }
        Err(AnalysisOutcome::Canceled) => {
            // Back to idle so the user can start over
            crate::db::songs::set_analysis_state(&ctx.db, song_id, AnalysisState::Idle).await?;
            crate::db::jobs::mark_canceled(&ctx.db, job.id).await?;
            ctx.event_bus.emit_lossy(MuvidEvent::JobCanceled {
                job_id: job.id,
                kind: "analyze".to_string(),
                timestamp: Utc::now(),
            });
            tracing::info!(song_id = %song_id, job_id = %job.id, "Analysis canceled");
            Ok(())
        }
        Err(AnalysisOutcome::Failed(error)) => {
            crate::db::songs::set_analysis_state(&ctx.db, song_id, AnalysisState::Failed).await?;
            crate::db::jobs::mark_failed(&ctx.db, job.id, &error).await?;
            ctx.event_bus.emit_lossy(MuvidEvent::AnalysisFailed {
                song_id,
                job_id: job.id,
                error: error.clone(),
                timestamp: Utc::now(),
            });
            tracing::error!(song_id = %song_id, job_id = %job.id, error = %error, "Analysis failed");
            Ok(())
        }
    }
}

/// Internal job outcome distinguishing cancellation from failure
enum AnalysisOutcome {
    Canceled,
    Failed(String),
}

impl From<anyhow::Error> for AnalysisOutcome {
    fn from(e: anyhow::Error) -> Self {
        AnalysisOutcome::Failed(format!("{e:#}"))
    }
}

async fn analyze(
    ctx: &WorkerContext,
    job: &JobRecord,
    song: &crate::models::Song,
    token: &CancellationToken,
) -> std::result::Result<SongAnalysis, AnalysisOutcome> {
    let song_id = song.id;

    // Fetch and decode; decode errors are non-retriable
    let bytes = ctx
        .blobs
        .get(&song.source_blob_key)
        .await
        .context("fetching source audio")
        .map_err(AnalysisOutcome::from)?;

    let extension = song
        .source_blob_key
        .rsplit('.')
        .next()
        .map(str::to_string);

    let decoded = tokio::task::spawn_blocking(move || {
        let audio = decode::decode_bytes(bytes, extension.as_deref())?;
        let frames = spectral::magnitude_frames(&audio.samples, audio.sample_rate)?;
        let beat_detection = beats::detect_beats(&frames, audio.duration_sec);
        let summary = waveform::summarize(&audio.samples, waveform::SUMMARY_LEN);
        Ok::<_, anyhow::Error>((audio, Arc::new(frames), beat_detection, summary))
    })
    .await
    .context("analysis task panicked")
    .map_err(AnalysisOutcome::from)?
    .map_err(AnalysisOutcome::from)?;

    let (audio, frames, beat_detection, summary) = decoded;

    crate::db::songs::set_duration_if_unset(&ctx.db, song_id, audio.duration_sec)
        .await
        .map_err(AnalysisOutcome::from)?;

    report_progress(ctx, job, song_id, 25.0, "Beat detection complete").await;
    if ctx.cancel_requested(job.id, token).await {
        return Err(AnalysisOutcome::Canceled);
    }

    // Sections: structure service first, internal segmenter on any
    // failure. Only an internal-segmenter failure aborts.
    let raw_sections =
        infer_sections(ctx, song, &frames, audio.duration_sec, &ctx.config.retry).await?;
    let min_section = ctx.config.effective_min_section_sec(audio.duration_sec);
    let mut section_list = sections::normalize_coverage(
        sections::merge_short_sections(raw_sections, min_section),
        audio.duration_sec,
    );

    report_progress(ctx, job, song_id, 50.0, "Sections inferred").await;
    if ctx.cancel_requested(job.id, token).await {
        return Err(AnalysisOutcome::Canceled);
    }

    // Mood and genre (non-fatal by construction)
    let mood_outcome = mood::analyze_mood(&audio.samples, &frames, &beat_detection);

    report_progress(ctx, job, song_id, 70.0, "Mood and genre computed").await;
    if ctx.cancel_requested(job.id, token).await {
        return Err(AnalysisOutcome::Canceled);
    }

    // Lyrics: optional and non-fatal
    transcribe_lyrics(ctx, song, &mut section_list).await;

    report_progress(ctx, job, song_id, 85.0, "Lyrics aligned").await;
    if ctx.cancel_requested(job.id, token).await {
        return Err(AnalysisOutcome::Canceled);
    }

    let mut analysis = SongAnalysis::new(song_id, 0);
    analysis.bpm = beat_detection.bpm;
    analysis.beat_times = beat_detection.beat_times;
    analysis.sections = section_list;
    analysis.mood = Some(mood_outcome.mood);
    analysis.mood_tags = mood_outcome.tags;
    analysis.genre = mood_outcome.genre;
    analysis.waveform = summary;

    if let Err(problem) = analysis.validate(audio.duration_sec) {
        return Err(AnalysisOutcome::Failed(format!(
            "analysis failed internal validation: {problem}"
        )));
    }

    crate::db::analyses::save_analysis(&ctx.db, &mut analysis)
        .await
        .map_err(AnalysisOutcome::from)?;

    report_progress(ctx, job, song_id, 100.0, "Analysis complete").await;

    Ok(analysis)
}

/// Section inference with the configured fallback chain
async fn infer_sections(
    ctx: &WorkerContext,
    song: &crate::models::Song,
    frames: &Arc<spectral::SpectralFrames>,
    duration_sec: f64,
    retry: &RetryPolicy,
) -> std::result::Result<Vec<Section>, AnalysisOutcome> {
    if let Some(endpoint) = ctx.config.services.structure.clone() {
        match StructureClient::new(endpoint) {
            Ok(client) => {
                let audio_url = ctx.blobs.read_url(
                    &song.source_blob_key,
                    std::time::Duration::from_secs(ctx.config.blob_url_ttl_sec),
                );
                match structure_with_retries(&client, &audio_url, duration_sec, retry).await {
                    Ok(sections) if !sections.is_empty() => return Ok(sections),
                    Ok(_) => {
                        tracing::warn!(song_id = %song.id, "Structure service returned no sections, falling back");
                    }
                    Err(e) => {
                        tracing::warn!(song_id = %song.id, error = %e, "Structure service failed, falling back to internal segmenter");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Structure client init failed, using internal segmenter");
            }
        }
    }

    let frames = Arc::clone(frames);
    tokio::task::spawn_blocking(move || sections::internal_segment(&frames, duration_sec))
        .await
        .context("internal segmenter panicked")
        .map_err(AnalysisOutcome::from)
}

async fn structure_with_retries(
    client: &StructureClient,
    audio_url: &str,
    duration_sec: f64,
    retry: &RetryPolicy,
) -> std::result::Result<Vec<Section>, StructureError> {
    let mut attempt = 1u32;
    loop {
        match client.infer(audio_url, duration_sec).await {
            Ok(sections) => return Ok(sections),
            Err(StructureError::Transient(message)) if attempt < retry.max_attempts => {
                let delay = retry.backoff_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_sec = delay.as_secs_f64(),
                    error = %message,
                    "Structure service transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Transcribe and align lyrics; any failure just leaves lyrics empty
async fn transcribe_lyrics(
    ctx: &WorkerContext,
    song: &crate::models::Song,
    sections: &mut [Section],
) {
    let Some(endpoint) = ctx.config.services.transcription.clone() else {
        return;
    };

    let client = match lyrics::TranscriptionClient::new(endpoint) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, "Transcription client init failed, skipping lyrics");
            return;
        }
    };

    let audio_url = ctx.blobs.read_url(
        &song.source_blob_key,
        std::time::Duration::from_secs(ctx.config.blob_url_ttl_sec),
    );

    let mut attempt = 1u32;
    let words = loop {
        match client.transcribe(&audio_url).await {
            Ok(words) => break words,
            Err(lyrics::TranscriptionError::Transient(message))
                if attempt < ctx.config.retry.max_attempts =>
            {
                let delay = ctx.config.retry.backoff_for_attempt(attempt);
                tracing::warn!(attempt, error = %message, "Transcription transient failure, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!(song_id = %song.id, error = %e, "Transcription failed, leaving lyrics empty");
                return;
            }
        }
    };

    lyrics::align_words_to_sections(&words, sections);
}

async fn report_progress(
    ctx: &WorkerContext,
    job: &JobRecord,
    song_id: Uuid,
    percent: f64,
    stage: &str,
) {
    if let Err(e) = crate::db::jobs::set_progress(&ctx.db, job.id, percent).await {
        tracing::warn!(job_id = %job.id, error = %e, "Failed to persist analysis progress");
    }
    ctx.event_bus.emit_lossy(MuvidEvent::AnalysisProgress {
        song_id,
        job_id: job.id,
        percent,
        stage: stage.to_string(),
        timestamp: Utc::now(),
    });
}
