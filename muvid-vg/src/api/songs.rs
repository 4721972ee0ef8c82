//! Song API handlers
//!
//! Upload, retrieval, creative-input selection (video type and audio
//! selection window), and deletion.

use crate::error::{ApiError, ApiResult};
use crate::models::{Song, VideoType};
use crate::storage::BlobStore;
use crate::AppState;
use axum::{
    extract::{Multipart, Path, State},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

/// Accepted source audio extensions
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "flac", "ogg"];

pub fn song_routes() -> Router<AppState> {
    Router::new()
        .route("/songs/", post(upload_song).get(list_songs))
        .route("/songs/:id", get(get_song).delete(delete_song))
        .route("/songs/:id/video-type", patch(set_video_type))
        .route("/songs/:id/audio-selection", patch(set_audio_selection))
}

/// POST /songs/ response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub song_id: Uuid,
    /// Short-lived read URL for the uploaded source
    pub source_url: String,
}

/// POST /songs/ - multipart upload of the source audio plus an optional
/// character reference image
pub async fn upload_song(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let mut audio: Option<(String, Vec<u8>)> = None;
    let mut character_image: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("reading upload: {e}")))?;
                audio = Some((filename, bytes.to_vec()));
            }
            "character_image" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("reading character image: {e}")))?;
                character_image = Some(bytes.to_vec());
            }
            other => {
                tracing::debug!(field = other, "Ignoring unknown multipart field");
            }
        }
    }

    let (filename, bytes) = audio
        .ok_or_else(|| ApiError::BadRequest("missing 'file' field".to_string()))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("uploaded file is empty".to_string()));
    }

    let extension = filename
        .rsplit('.')
        .next()
        .map(str::to_lowercase)
        .filter(|e| AUDIO_EXTENSIONS.contains(&e.as_str()))
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "unsupported audio format; expected one of {AUDIO_EXTENSIONS:?}"
            ))
        })?;

    let song_id = Uuid::new_v4();
    let source_key = BlobStore::source_key(song_id, &extension);

    state
        .blobs
        .put(&source_key, &bytes)
        .await
        .map_err(|e| ApiError::Internal(format!("storing upload: {e}")))?;

    let mut song = Song::new(source_key.clone(), Some(filename));
    song.id = song_id;
    song.content_hash = Some(crate::storage::sha256_hex(&bytes));

    if let Some(image) = character_image {
        let image_key = BlobStore::character_key(song_id);
        state
            .blobs
            .put(&image_key, &image)
            .await
            .map_err(|e| ApiError::Internal(format!("storing character image: {e}")))?;
        song.character_image_key = Some(image_key);
    }

    crate::db::songs::insert_song(&state.db, &song).await?;

    tracing::info!(
        song_id = %song_id,
        bytes = bytes.len(),
        has_character_image = song.character_image_key.is_some(),
        "Song uploaded"
    );

    let source_url = state
        .blobs
        .read_url(&source_key, Duration::from_secs(state.config.blob_url_ttl_sec));

    Ok(Json(UploadResponse { song_id, source_url }))
}

/// GET /songs/:id
pub async fn get_song(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Song>> {
    let song = crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;
    Ok(Json(song))
}

/// GET /songs/
pub async fn list_songs(State(state): State<AppState>) -> ApiResult<Json<Vec<Song>>> {
    Ok(Json(crate::db::songs::list_songs(&state.db, 100).await?))
}

/// PATCH /songs/:id/video-type request
#[derive(Debug, Deserialize)]
pub struct SetVideoTypeRequest {
    pub video_type: String,
}

/// PATCH /songs/:id/video-type - set exactly once, before any analysis
pub async fn set_video_type(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SetVideoTypeRequest>,
) -> ApiResult<Json<Song>> {
    let video_type = VideoType::parse(&request.video_type).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "video_type must be full_length or short_form, got {:?}",
            request.video_type
        ))
    })?;

    crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;

    // Immutable once any analysis exists
    if crate::db::analyses::exists_for_song(&state.db, id).await? {
        return Err(ApiError::Conflict(
            "video type cannot change after analysis".to_string(),
        ));
    }

    if !crate::db::songs::set_video_type(&state.db, id, video_type).await? {
        return Err(ApiError::Conflict("video type is already set".to_string()));
    }

    let song = crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;
    Ok(Json(song))
}

/// PATCH /songs/:id/audio-selection request
#[derive(Debug, Deserialize)]
pub struct SetSelectionRequest {
    pub start_sec: f64,
    pub end_sec: f64,
}

/// PATCH /songs/:id/audio-selection - short-form selection window
pub async fn set_audio_selection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SetSelectionRequest>,
) -> ApiResult<Json<Song>> {
    let song = crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;

    if song.video_type != Some(VideoType::ShortForm) {
        return Err(ApiError::Conflict(
            "audio selection applies to short-form songs only".to_string(),
        ));
    }

    let (start, end) = (request.start_sec, request.end_sec);
    if start < 0.0 || end <= start {
        return Err(ApiError::BadRequest(format!(
            "selection requires 0 <= start < end, got [{start}, {end}]"
        )));
    }
    let length = end - start;
    if length < 1.0 {
        return Err(ApiError::BadRequest(format!(
            "selection of {length:.3} s is below the 1 s minimum"
        )));
    }
    if length > 30.0 {
        return Err(ApiError::BadRequest(format!(
            "selection of {length:.3} s exceeds the 30 s maximum"
        )));
    }
    if let Some(duration) = song.duration_sec {
        if end > duration + 1e-6 {
            return Err(ApiError::BadRequest(format!(
                "selection end {end:.3} s is past the song end {duration:.3} s"
            )));
        }
    }

    crate::db::songs::set_selection(&state.db, id, start, end).await?;

    let song = crate::db::songs::get_song(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("song {id}")))?;
    Ok(Json(song))
}

/// DELETE /songs/:id - dependents cascade; blobs fall to the sweeper
pub async fn delete_song(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    if !crate::db::songs::delete_song(&state.db, id).await? {
        return Err(ApiError::NotFound(format!("song {id}")));
    }
    tracing::info!(song_id = %id, "Song deleted");
    Ok(Json(json!({ "deleted": id })))
}
