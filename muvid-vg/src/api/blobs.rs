//! Signed blob read handler
//!
//! Serves the short-lived read URLs produced by the blob store. The
//! token binds the key and expiry; anything else is a 404 so the
//! handler leaks no information about the tree.

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;

pub fn blob_routes() -> Router<AppState> {
    Router::new().route("/blobs/*key", get(read_blob))
}

#[derive(Debug, Deserialize)]
pub struct BlobQuery {
    pub exp: i64,
    pub tok: String,
}

/// GET /blobs/*key?exp=..&tok=..
pub async fn read_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<BlobQuery>,
) -> ApiResult<impl IntoResponse> {
    if !state.blobs.verify_token(&key, query.exp, &query.tok) {
        return Err(ApiError::NotFound("blob".to_string()));
    }

    let bytes = state
        .blobs
        .get(&key)
        .await
        .map_err(|_| ApiError::NotFound("blob".to_string()))?;

    let content_type = match key.rsplit('.').next() {
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    };

    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}
