//! Server-Sent Events (SSE) utilities
//!
//! Shared SSE helpers for evsyn services.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{info, warn};

use crate::events::EventBus;

/// Heartbeat interval for every evsyn SSE stream
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Keep-alive settings shared by all streams
pub fn keep_alive() -> KeepAlive {
    KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat")
}

/// Serialize a payload into a named SSE event
///
/// Returns None (and logs) if serialization fails so a stream can skip it.
pub fn json_event<T: Serialize>(event_type: &str, payload: &T) -> Option<Event> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(Event::default().event(event_type).data(json)),
        Err(e) => {
            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
            None
        }
    }
}

/// SSE stream forwarding every ServiceEvent from the bus
///
/// Lagged subscribers skip the dropped events and keep streaming.
pub fn service_event_stream(
    service_name: &'static str,
    event_bus: &EventBus,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to {} service events", service_name);

    let mut rx = event_bus.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(sse_event) = json_event(event.event_type(), &event) {
                        yield Ok(sse_event);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE: {} service stream lagged, skipped {} events", service_name, skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(keep_alive())
}
