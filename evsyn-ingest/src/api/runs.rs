//! Run API handlers
//!
//! GET /runs/:id, POST /runs/:id/cancel, GET /runs/:id/result

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiResult,
    models::{RunResult, RunSnapshot, RunStatus},
    AppState,
};

/// POST /runs/:id/cancel response
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelRunResponse {
    pub run_id: Uuid,
    /// Status when the request was handled; a terminal status means nothing changed
    pub status: RunStatus,
    pub cancel_requested: bool,
}

/// GET /runs/:id
pub async fn get_run_status(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunSnapshot>> {
    Ok(Json(state.registry.get_status(run_id).await?))
}

/// POST /runs/:id/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<CancelRunResponse>> {
    let status = state.registry.cancel(run_id).await?;
    Ok(Json(CancelRunResponse {
        run_id,
        status,
        cancel_requested: !status.is_terminal(),
    }))
}

/// GET /runs/:id/result
///
/// 409 Conflict while the run is still in flight.
pub async fn get_run_result(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunResult>> {
    Ok(Json(state.registry.get_result(run_id).await?))
}

pub fn run_routes() -> Router<AppState> {
    Router::new()
        .route("/runs/:id", get(get_run_status))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/runs/:id/result", get(get_run_result))
}
