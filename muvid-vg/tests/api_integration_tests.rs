//! Integration tests for the muvid-vg API surface
//!
//! Exercises the HTTP layer against an in-memory database and a temp
//! blob store, without workers: enqueue endpoints are checked for their
//! record-store effects, not for background execution.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

/// Synthesize a small WAV upload body (1 s of 440 Hz)
fn wav_bytes() -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 22_050,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for t in 0..22_050 {
            let sample = (t as f32 * 440.0 * 2.0 * std::f32::consts::PI / 22_050.0).sin();
            writer
                .write_sample((sample * i16::MAX as f32) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn multipart_upload(filename: &str, bytes: &[u8]) -> (String, Vec<u8>) {
    let boundary = "muvid-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

async fn upload_song(app: &axum::Router) -> Value {
    let (content_type, body) = multipart_upload("track.wav", &wav_bytes());
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/songs/")
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

async fn patch_json(app: &axum::Router, uri: &str, body: Value) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn post(app: &axum::Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn get(app: &axum::Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (state, _dir) = common::test_state(None).await;
    let app = muvid_vg::build_router(state);

    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "muvid-vg");
}

#[tokio::test]
async fn test_upload_creates_song_and_blob() {
    let (state, _dir) = common::test_state(None).await;
    let app = muvid_vg::build_router(state.clone());

    let json = upload_song(&app).await;
    let song_id = json["song_id"].as_str().unwrap().to_string();
    assert!(json["source_url"].as_str().unwrap().starts_with("/blobs/"));

    let response = get(&app, &format!("/songs/{song_id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let song = body_json(response).await;
    assert_eq!(song["analysis_state"], "idle");
    assert!(song["video_type"].is_null());

    // The signed source URL serves the uploaded bytes
    let source_url = json["source_url"].as_str().unwrap().to_string();
    let response = get(&app, &source_url).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_upload_rejects_unknown_extension() {
    let (state, _dir) = common::test_state(None).await;
    let app = muvid_vg::build_router(state);

    let (content_type, body) = multipart_upload("malware.exe", b"nope");
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/songs/")
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_video_type_set_exactly_once() {
    let (state, _dir) = common::test_state(None).await;
    let app = muvid_vg::build_router(state);

    let song_id = upload_song(&app).await["song_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = patch_json(
        &app,
        &format!("/songs/{song_id}/video-type"),
        json!({"video_type": "short_form"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Second attempt conflicts
    let response = patch_json(
        &app,
        &format!("/songs/{song_id}/video-type"),
        json!({"video_type": "full_length"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Unknown value is a validation error
    let response = patch_json(
        &app,
        &format!("/songs/{song_id}/video-type"),
        json!({"video_type": "vertical"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_audio_selection_boundaries() {
    let (state, _dir) = common::test_state(None).await;
    let app = muvid_vg::build_router(state);

    let song_id = upload_song(&app).await["song_id"]
        .as_str()
        .unwrap()
        .to_string();
    patch_json(
        &app,
        &format!("/songs/{song_id}/video-type"),
        json!({"video_type": "short_form"}),
    )
    .await;

    // Exactly 30 s is accepted (song duration unknown yet, so end is
    // unconstrained by it)
    let response = patch_json(
        &app,
        &format!("/songs/{song_id}/audio-selection"),
        json!({"start_sec": 40.0, "end_sec": 70.0}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // 30.001 s is rejected
    let response = patch_json(
        &app,
        &format!("/songs/{song_id}/audio-selection"),
        json!({"start_sec": 40.0, "end_sec": 70.001}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Inverted window is rejected
    let response = patch_json(
        &app,
        &format!("/songs/{song_id}/audio-selection"),
        json!({"start_sec": 50.0, "end_sec": 40.0}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_selection_requires_short_form() {
    let (state, _dir) = common::test_state(None).await;
    let app = muvid_vg::build_router(state);

    let song_id = upload_song(&app).await["song_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = patch_json(
        &app,
        &format!("/songs/{song_id}/audio-selection"),
        json!({"start_sec": 0.0, "end_sec": 20.0}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_analyze_enqueues_job_and_status_is_pollable() {
    let (state, _dir) = common::test_state(None).await;
    let app = muvid_vg::build_router(state.clone());

    let song_id = upload_song(&app).await["song_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = post(&app, &format!("/songs/{song_id}/analyze")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let job_id = json["job_id"].as_str().unwrap().to_string();

    // Song flips to queued
    let song = body_json(get(&app, &format!("/songs/{song_id}")).await).await;
    assert_eq!(song["analysis_state"], "queued");

    // Job status endpoint serves the row
    let status = body_json(get(&app, &format!("/jobs/{job_id}")).await).await;
    assert_eq!(status["status"], "queued");
    assert_eq!(status["progress"], 0.0);

    // A second analyze while one is pending conflicts
    let response = post(&app, &format!("/songs/{song_id}/analyze")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_plan_requires_analysis() {
    let (state, _dir) = common::test_state(None).await;
    let app = muvid_vg::build_router(state);

    let song_id = upload_song(&app).await["song_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = post(&app, &format!("/songs/{song_id}/clips/plan")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_boundaries_read_through_for_analyzed_song() {
    let (state, _dir) = common::test_state(None).await;
    let song = common::seed_analyzed_song(&state).await;
    let app = muvid_vg::build_router(state);

    let response = get(
        &app,
        &format!("/songs/{}/beat-aligned-boundaries?fps=24", song.id),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let clips = json["clips"].as_array().unwrap();
    assert!(!clips.is_empty());
    assert_eq!(json["status"], "valid");
    // Clips stay within the selection window
    assert_eq!(clips[0]["start_sec"], 40.0);
    assert_eq!(clips.last().unwrap()["end_sec"], 70.0);
}

#[tokio::test]
async fn test_plan_creates_expected_clip_count() {
    let (state, _dir) = common::test_state(None).await;
    let song = common::seed_analyzed_song(&state).await;
    let app = muvid_vg::build_router(state.clone());

    let response = post(&app, &format!("/songs/{}/clips/plan?clip_count=6", song.id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;

    // 30 s selection at 120 BPM with 6 requested clips: exactly six
    // 5 s windows, every boundary on a beat
    assert_eq!(json["clip_count"], 6);
    assert_eq!(json["status"], "valid");
    assert!(json["max_alignment_error"].as_f64().unwrap() <= 0.050);

    let clips = body_json(get(&app, &format!("/songs/{}/clips", song.id)).await).await;
    let clips = clips.as_array().unwrap().clone();
    assert_eq!(clips.len(), 6);
    for clip in &clips {
        assert_eq!(clip["status"], "queued");
        assert_eq!(clip["requested_fps"], 24);
        assert_eq!(clip["requested_frames"], 120);
        assert!(!clip["prompt"].as_str().unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_generate_requires_plan_and_reports_batch_job() {
    let (state, _dir) = common::test_state(None).await;
    let song = common::seed_analyzed_song(&state).await;
    let app = muvid_vg::build_router(state.clone());

    // No plan yet
    let response = post(&app, &format!("/songs/{}/clips/generate", song.id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    post(&app, &format!("/songs/{}/clips/plan?clip_count=6", song.id)).await;

    let response = post(&app, &format!("/songs/{}/clips/generate", song.id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let batch = body_json(response).await;
    assert_eq!(batch["kind"], "clip_batch");

    // The active batch is discoverable without client session state
    let active = body_json(get(&app, &format!("/songs/{}/clips/job", song.id)).await).await;
    assert_eq!(active["id"], batch["id"]);

    // A second generate call conflicts while the batch is active
    let response = post(&app, &format!("/songs/{}/clips/generate", song.id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_clip_status_aggregates() {
    let (state, _dir) = common::test_state(None).await;
    let song = common::seed_analyzed_song(&state).await;
    let app = muvid_vg::build_router(state.clone());

    post(&app, &format!("/songs/{}/clips/plan?clip_count=6", song.id)).await;

    let status = body_json(get(&app, &format!("/songs/{}/clips/status", song.id)).await).await;
    assert_eq!(status["total"], 6);
    assert_eq!(status["completed"], 0);
    assert_eq!(status["counts"]["queued"], 6);
    assert!(status["composed_video_url"].is_null());
}

#[tokio::test]
async fn test_compose_requires_completed_clips() {
    let (state, _dir) = common::test_state(None).await;
    let song = common::seed_analyzed_song(&state).await;
    let app = muvid_vg::build_router(state.clone());

    post(&app, &format!("/songs/{}/clips/plan?clip_count=6", song.id)).await;

    let response = post(&app, &format!("/songs/{}/clips/compose/async", song.id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_song_is_404() {
    let (state, _dir) = common::test_state(None).await;
    let app = muvid_vg::build_router(state);

    let id = uuid::Uuid::new_v4();
    for uri in [
        format!("/songs/{id}"),
        format!("/songs/{id}/analysis"),
        format!("/songs/{id}/clips/status"),
    ] {
        let response = get(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn test_delete_song_cascades() {
    let (state, _dir) = common::test_state(None).await;
    let song = common::seed_analyzed_song(&state).await;
    let app = muvid_vg::build_router(state.clone());

    post(&app, &format!("/songs/{}/clips/plan?clip_count=6", song.id)).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/songs/{}", song.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(muvid_vg::db::clips::clips_for_song(&state.db, song.id)
        .await
        .unwrap()
        .is_empty());
    assert!(
        muvid_vg::db::analyses::latest_for_song(&state.db, song.id)
            .await
            .unwrap()
            .is_none()
    );
}
