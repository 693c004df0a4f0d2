//! Server-Sent Events
//!
//! - GET /runs/:id/events: one run's progress (history, then live events)
//! - GET /events: service lifecycle events

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{error::ApiResult, workflow::SubscriptionItem, AppState};
use evsyn_common::sse::{json_event, keep_alive};

/// GET /runs/:id/events
///
/// Streams `StageStarted`, `StudyCompleted`, `StageCompleted` and
/// `RunFinished` events, then ends. A `lossy` event reports events dropped
/// because this client fell behind.
pub async fn run_event_stream(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut subscription = state.registry.subscribe(run_id).await?;
    info!(run_id = %run_id, "New SSE client connected to run progress");

    let stream = async_stream::stream! {
        while let Some(item) = subscription.recv().await {
            match item {
                SubscriptionItem::Event(event) => {
                    if let Some(sse_event) = json_event(event.event_type(), &event) {
                        yield Ok(sse_event);
                    }
                }
                SubscriptionItem::Lagged(dropped) => {
                    if let Some(sse_event) = json_event("lossy", &json!({ "run_id": run_id, "dropped": dropped })) {
                        yield Ok(sse_event);
                    }
                }
            }
        }
        debug!(run_id = %run_id, "SSE: run progress stream complete");
    };

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

/// GET /events
pub async fn service_event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    evsyn_common::sse::service_event_stream("evsyn-ingest", &state.event_bus)
}
