//! Error types for evsyn-ingest
//!
//! Two layers:
//! - `PipelineError`: domain errors returned synchronously by registry operations
//!   and by the run state machine
//! - `ApiError`: HTTP boundary error with status/code mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Domain errors for pipeline and run operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Invalid pipeline/run parameters, rejected before any stage runs
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Unknown pipeline id
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(Uuid),

    /// Unknown run id
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// Result requested before the run reached a terminal state
    #[error("Run {0} has not finished yet")]
    NotReady(Uuid),

    /// Status change refused by the run state machine
    #[error("Invalid state: {0}")]
    StateError(String),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409) - e.g., result requested while run still in flight
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// evsyn-common error
    #[error("Common error: {0}")]
    Common(#[from] evsyn_common::Error),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidConfiguration(_) => ApiError::BadRequest(err.to_string()),
            PipelineError::PipelineNotFound(_) | PipelineError::RunNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            PipelineError::NotReady(_) | PipelineError::StateError(_) => {
                ApiError::Conflict(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
