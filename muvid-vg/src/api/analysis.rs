//! Analysis API handlers

use crate::error::{ApiError, ApiResult};
use crate::models::{AnalysisState, JobKind, JobRecord, SongAnalysis};
use crate::planning::{align_clips, AlignmentResult, BeatAlignParams};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn analysis_routes() -> Router<AppState> {
    Router::new()
        .route("/songs/:id/analyze", post(enqueue_analysis))
        .route("/songs/:id/analysis", get(get_analysis))
        .route(
            "/songs/:id/beat-aligned-boundaries",
            get(beat_aligned_boundaries),
        )
}

/// POST /songs/:id/analyze response
#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub job_id: Uuid,
    pub song_id: Uuid,
}

/// POST /songs/:id/analyze - enqueue analysis, 202-style
pub async fn enqueue_analysis(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AnalyzeResponse>> {
    let song = crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;

    if !state.blobs.exists(&song.source_blob_key).await {
        return Err(ApiError::Conflict(
            "source audio blob is missing".to_string(),
        ));
    }

    // One analysis in flight per song
    if let Some(existing) =
        crate::db::jobs::latest_for_song_kind(&state.db, id, JobKind::Analyze).await?
    {
        if !existing.status.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "analysis already running (job {})",
                existing.id
            )));
        }
    }

    let job = JobRecord::new(
        state.config.default_queue(),
        JobKind::Analyze,
        Some(id),
        serde_json::json!({}),
        state.config.workers.default_queue_timeout_sec as i64,
    );
    crate::db::jobs::enqueue(&state.db, &job).await?;
    crate::db::songs::set_analysis_state(&state.db, id, AnalysisState::Queued).await?;

    tracing::info!(song_id = %id, job_id = %job.id, "Analysis enqueued");

    Ok(Json(AnalyzeResponse {
        job_id: job.id,
        song_id: id,
    }))
}

/// GET /songs/:id/analysis - latest analysis record
pub async fn get_analysis(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SongAnalysis>> {
    crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;

    let analysis = crate::db::analyses::latest_for_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no analysis for song {id}")))?;

    Ok(Json(analysis))
}

/// GET /songs/:id/beat-aligned-boundaries query
#[derive(Debug, Deserialize)]
pub struct BoundariesQuery {
    /// Target frame rate; defaults to the configured output fps
    pub fps: Option<u32>,
    pub min_clip_sec: Option<f64>,
    pub max_clip_sec: Option<f64>,
}

/// GET /songs/:id/beat-aligned-boundaries - pure read-through to the
/// beat alignment engine over the stored analysis
pub async fn beat_aligned_boundaries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<BoundariesQuery>,
) -> ApiResult<Json<AlignmentResult>> {
    let song = crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;

    let analysis = crate::db::analyses::latest_for_song(&state.db, id)
        .await?
        .ok_or_else(|| {
            ApiError::Conflict("no analysis exists for this song; run analysis first".to_string())
        })?;

    let duration = song
        .duration_sec
        .ok_or_else(|| ApiError::Conflict("song duration not yet known".to_string()))?;

    let params = BeatAlignParams {
        min_clip_sec: query.min_clip_sec.unwrap_or(state.config.limits.min_clip_sec),
        max_clip_sec: query.max_clip_sec.unwrap_or(state.config.limits.max_clip_sec),
        target_fps: query.fps.unwrap_or(state.config.video.fps),
        selection: song.effective_window(),
    };

    if params.min_clip_sec <= 0.0 || params.max_clip_sec < params.min_clip_sec {
        return Err(ApiError::BadRequest(format!(
            "invalid clip bounds [{}, {}]",
            params.min_clip_sec, params.max_clip_sec
        )));
    }

    Ok(Json(align_clips(&analysis.beat_times, duration, &params)))
}
