//! Pipeline API handlers
//!
//! POST /pipelines, GET /pipelines, GET|DELETE /pipelines/:id,
//! POST|GET /pipelines/:id/runs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::{InputFormat, Pipeline, PipelineConfig, RunSnapshot, RunStatus},
    workflow::RawBatch,
    AppState,
};

/// POST /pipelines/:id/runs request
///
/// Exactly one of `records` (JSON objects) or `text` (delimited) is required.
#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub format: String,
    #[serde(default)]
    pub records: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl StartRunRequest {
    fn into_parts(self) -> ApiResult<(InputFormat, RawBatch, Option<String>)> {
        let format = InputFormat::parse(&self.format)
            .ok_or_else(|| ApiError::BadRequest(format!("Unsupported format: {}", self.format)))?;

        let batch = match (self.records, self.text) {
            (Some(records), None) => RawBatch::Records(records),
            (None, Some(text)) => RawBatch::Text(text),
            (Some(_), Some(_)) => {
                return Err(ApiError::BadRequest(
                    "Provide either records or text, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(ApiError::BadRequest(
                    "Request must include records or text".to_string(),
                ))
            }
        };

        Ok((format, batch, self.idempotency_key))
    }
}

/// POST /pipelines/:id/runs response
#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub run_id: Uuid,
    pub status: RunStatus,
}

/// POST /pipelines
///
/// Register a pipeline configuration. Returns 201 with the pipeline.
pub async fn create_pipeline(
    State(state): State<AppState>,
    Json(config): Json<PipelineConfig>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    let pipeline = state.registry.create_pipeline(config).await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

/// GET /pipelines
pub async fn list_pipelines(State(state): State<AppState>) -> Json<Vec<Pipeline>> {
    Json(state.registry.list_pipelines().await)
}

/// GET /pipelines/:id
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
) -> ApiResult<Json<Pipeline>> {
    Ok(Json(state.registry.get_pipeline(pipeline_id).await?))
}

/// DELETE /pipelines/:id
///
/// In-flight runs of the pipeline are cancelled at their next stage boundary.
pub async fn delete_pipeline(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.registry.delete_pipeline(pipeline_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /pipelines/:id/runs
///
/// Accept a batch. Returns 202 Accepted with the run id; processing continues
/// in the background.
pub async fn start_run(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
    Json(request): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<StartRunResponse>)> {
    let (format, batch, idempotency_key) = request.into_parts()?;
    let run_id = state
        .registry
        .start_run(pipeline_id, format, batch, idempotency_key)
        .await?;
    let snapshot = state.registry.get_status(run_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            run_id,
            status: snapshot.status,
        }),
    ))
}

/// GET /pipelines/:id/runs
pub async fn list_runs(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
) -> ApiResult<Json<Vec<RunSnapshot>>> {
    Ok(Json(state.registry.list_runs(pipeline_id).await?))
}

pub fn pipeline_routes() -> Router<AppState> {
    Router::new()
        .route("/pipelines", post(create_pipeline).get(list_pipelines))
        .route("/pipelines/:id", get(get_pipeline).delete(delete_pipeline))
        .route("/pipelines/:id/runs", post(start_run).get(list_runs))
}
