//! Health check handler

use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime = (chrono::Utc::now() - state.startup_time).num_seconds();
    Json(json!({
        "status": "ok",
        "module": "muvid-vg",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
    }))
}
