//! Job status and cancellation handlers
//!
//! The status endpoint serves the latest job row from the record store;
//! clients poll it and need no session state. Cancellation is a request:
//! the job surfaces `canceled` once a worker honors it at a checkpoint.

use crate::error::{ApiError, ApiResult};
use crate::models::{JobKind, JobStatus};
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/songs/:id/jobs", get(song_jobs))
}

/// GET /jobs/:id response
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub kind: JobKind,
    /// queued | processing | completed | failed | canceled
    pub status: String,
    /// Percent complete in [0, 100]
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Kind-specific result payload, when the job completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// GET /jobs/:id
pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = crate::db::jobs::get_job(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;

    // Canceling is an internal transition; clients see processing until
    // the worker confirms the cancel
    let status = match job.status {
        JobStatus::Canceling => "processing".to_string(),
        other => other.as_str().to_string(),
    };

    let result = if job.status == JobStatus::Completed {
        build_result(&state, &job).await
    } else {
        None
    };

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        kind: job.kind,
        status,
        progress: job.progress,
        error: job.error,
        result,
    }))
}

async fn build_result(
    state: &AppState,
    job: &crate::models::JobRecord,
) -> Option<serde_json::Value> {
    let song_id = job.song_id?;
    match job.kind {
        JobKind::Compose => {
            let video = crate::db::composed_videos::latest_for_song(&state.db, song_id)
                .await
                .ok()??;
            let url = state.blobs.read_url(
                &video.blob_key,
                std::time::Duration::from_secs(state.config.blob_url_ttl_sec),
            );
            Some(serde_json::json!({
                "composed_video_id": video.id,
                "url": url,
                "duration_sec": video.duration_sec,
                "width": video.width,
                "height": video.height,
            }))
        }
        JobKind::ClipBatch => {
            let counts = crate::db::clips::status_counts(&state.db, song_id).await.ok()?;
            serde_json::to_value(&counts).ok()
        }
        JobKind::Analyze => {
            let analysis = crate::db::analyses::latest_for_song(&state.db, song_id)
                .await
                .ok()??;
            Some(serde_json::json!({
                "analysis_id": analysis.id,
                "version": analysis.version,
                "bpm": analysis.bpm,
                "sections": analysis.sections.len(),
            }))
        }
        JobKind::ClipGenerate => None,
    }
}

/// GET /songs/:id/jobs response: the most recent job per kind
///
/// Lets a reloaded client reconstruct what is in flight for a song
/// without any session state of its own.
#[derive(Debug, Serialize)]
pub struct SongJobsResponse {
    pub analyze: Option<crate::models::JobRecord>,
    pub clip_batch: Option<crate::models::JobRecord>,
    pub compose: Option<crate::models::JobRecord>,
}

/// GET /songs/:id/jobs
pub async fn song_jobs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SongJobsResponse>> {
    crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;

    Ok(Json(SongJobsResponse {
        analyze: crate::db::jobs::latest_for_song_kind(&state.db, id, JobKind::Analyze).await?,
        clip_batch: crate::db::jobs::latest_for_song_kind(&state.db, id, JobKind::ClipBatch)
            .await?,
        compose: crate::db::jobs::latest_for_song_kind(&state.db, id, JobKind::Compose).await?,
    }))
}

/// POST /jobs/:id/cancel - request cooperative cancellation
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = crate::db::jobs::get_job(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;

    if job.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "job is already {}",
            job.status.as_str()
        )));
    }

    match job.kind {
        JobKind::ClipBatch => {
            let ctx = state.worker_context();
            crate::clips::cancel_batch(&ctx, id).await?;
        }
        JobKind::Compose => {
            crate::db::jobs::request_cancel(&state.db, id).await?;
            // Flag the composition row too so other-process workers see it
            if let Ok(payload) =
                serde_json::from_value::<crate::compose::ComposePayload>(job.payload.clone())
            {
                crate::db::compositions::request_cancel(&state.db, payload.composition_job_id)
                    .await?;
            }
            state.cancellations.cancel(id).await;
        }
        _ => {
            crate::db::jobs::request_cancel(&state.db, id).await?;
            state.cancellations.cancel(id).await;
        }
    }

    tracing::info!(job_id = %id, kind = job.kind.as_str(), "Cancellation requested");

    Ok(Json(serde_json::json!({ "job_id": id, "canceling": true })))
}
