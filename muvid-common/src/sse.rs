//! Server-Sent Events (SSE) utilities
//!
//! Shared SSE implementations for muvid services.

use crate::events::EventBus;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info};

/// Create an SSE stream that forwards EventBus events to the client
///
/// Each event is serialized to JSON and tagged with its event type so
/// browser clients can use addEventListener per event kind. A heartbeat
/// comment is interleaved so proxies keep the connection open while a
/// pipeline is idle.
pub fn create_event_sse_stream(
    service_name: &'static str,
    event_bus: &EventBus,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to {} events", service_name);

    let mut rx = event_bus.subscribe();

    let stream = async_stream::stream! {
        // Send initial connected status
        yield Ok(Event::default()
            .event("ConnectionStatus")
            .data("connected"));

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(event) => {
                            match serde_json::to_string(&event) {
                                Ok(json) => {
                                    yield Ok(Event::default()
                                        .event(event.event_type())
                                        .data(json));
                                }
                                Err(e) => {
                                    debug!(error = %e, "Failed to serialize event for SSE");
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "SSE client lagged, events dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    yield Ok(Event::default().comment("heartbeat"));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

