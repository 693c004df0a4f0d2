//! evsyn-ingest library interface
//!
//! Exposes the ingestion pipeline core and HTTP surface for the binary and
//! for integration testing.

pub mod api;
pub mod config;
pub mod error;
pub mod fields;
pub mod inference;
pub mod models;
pub mod stages;
pub mod workflow;

pub use crate::error::{ApiError, ApiResult, PipelineError, PipelineResult};

use axum::Router;
use chrono::{DateTime, Utc};
use evsyn_common::events::EventBus;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::workflow::PipelineRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Pipelines and runs
    pub registry: Arc<PipelineRegistry>,
    /// Service lifecycle events for GET /events
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(registry: Arc<PipelineRegistry>) -> Self {
        Self {
            event_bus: registry.event_bus().clone(),
            registry,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::pipeline_routes())
        .merge(api::run_routes())
        .route("/runs/:id/events", get(api::run_event_stream))
        .route("/events", get(api::service_event_stream))
        .merge(api::health_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
