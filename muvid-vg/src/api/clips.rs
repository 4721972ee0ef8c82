//! Clip API handlers: plan, generate, retry, status

use crate::clips::{self, ClipBatchStatus};
use crate::error::{ApiError, ApiResult};
use crate::models::{Clip, JobRecord};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn clip_routes() -> Router<AppState> {
    Router::new()
        .route("/songs/:id/clips", get(list_clips))
        .route("/songs/:id/clips/plan", post(plan))
        .route("/songs/:id/clips/generate", post(generate))
        .route("/songs/:id/clips/:clip_id/retry", post(retry))
        .route("/songs/:id/clips/status", get(status))
        .route("/songs/:id/clips/job", get(active_job))
}

/// POST /songs/:id/clips/plan query
#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    pub clip_count: Option<usize>,
    pub max_clip_sec: Option<f64>,
}

/// POST /songs/:id/clips/plan response
#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub song_id: Uuid,
    pub clip_count: usize,
    pub reused: usize,
    pub max_alignment_error: f64,
    pub avg_alignment_error: f64,
    pub status: crate::planning::AlignmentStatus,
    pub entries: Vec<crate::models::PlanEntry>,
}

/// POST /songs/:id/clips/plan - replace the clip plan
pub async fn plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<PlanQuery>,
) -> ApiResult<Json<PlanResponse>> {
    let outcome = clips::plan_clips(
        &state.db,
        &state.config,
        &state.event_bus,
        id,
        query.clip_count,
        query.max_clip_sec,
    )
    .await?;

    Ok(Json(PlanResponse {
        song_id: id,
        clip_count: outcome.entries.len(),
        reused: outcome.reused,
        max_alignment_error: outcome.alignment.max_alignment_error,
        avg_alignment_error: outcome.alignment.avg_alignment_error,
        status: outcome.alignment.status,
        entries: outcome.entries,
    }))
}

/// POST /songs/:id/clips/generate - enqueue generation for pending clips
pub async fn generate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobRecord>> {
    let batch = clips::generate(&state.db, &state.config, id).await?;
    Ok(Json(batch))
}

/// POST /songs/:id/clips/:clip_id/retry - reset and re-enqueue
pub async fn retry(
    State(state): State<AppState>,
    Path((song_id, clip_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Clip>> {
    let clip = crate::db::clips::get_clip(&state.db, clip_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("clip {clip_id}")))?;
    if clip.song_id != song_id {
        return Err(ApiError::NotFound(format!(
            "clip {clip_id} does not belong to song {song_id}"
        )));
    }

    let clip = clips::retry_clip(&state.db, &state.config, clip_id).await?;
    Ok(Json(clip))
}

/// GET /songs/:id/clips/status - aggregate counts and the composed URL
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ClipBatchStatus>> {
    crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;

    Ok(Json(clips::status(&state.db, &state.blobs, id).await?))
}

/// GET /songs/:id/clips - full clip list
pub async fn list_clips(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Clip>>> {
    crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;

    Ok(Json(crate::db::clips::clips_for_song(&state.db, id).await?))
}

/// GET /songs/:id/clips/job - active batch generation job, if any
pub async fn active_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Option<JobRecord>>> {
    crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;

    Ok(Json(
        crate::db::jobs::active_batch_for_song(&state.db, id).await?,
    ))
}
