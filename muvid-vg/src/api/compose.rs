//! Composition API handlers

use crate::error::ApiResult;
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

pub fn compose_routes() -> Router<AppState> {
    Router::new().route("/songs/:id/clips/compose/async", post(enqueue))
}

/// POST /songs/:id/clips/compose/async response
#[derive(Debug, Serialize)]
pub struct ComposeResponse {
    pub song_id: Uuid,
    pub composition_id: Uuid,
    pub job_id: Uuid,
}

/// POST /songs/:id/clips/compose/async - enqueue composition of the
/// song's completed clips
pub async fn enqueue(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ComposeResponse>> {
    let (composition, job) =
        crate::compose::enqueue_composition(&state.db, &state.config, id).await?;

    Ok(Json(ComposeResponse {
        song_id: id,
        composition_id: composition.id,
        job_id: job.id,
    }))
}
