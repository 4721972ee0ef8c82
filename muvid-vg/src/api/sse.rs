//! SSE progress stream

use crate::AppState;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use std::convert::Infallible;

/// GET /events - forward the event bus to connected UI clients
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    muvid_common::sse::create_event_sse_stream("muvid-vg", &state.event_bus)
}
