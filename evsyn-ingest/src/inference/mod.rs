//! External inference service boundary
//!
//! Every stage consults an `InferenceClient` with a task type, a JSON payload
//! and a model id. Implementations:
//! - `HttpInferenceClient`: remote service over HTTP
//! - `HeuristicInferenceClient`: deterministic offline rules
//!
//! Every payload carries a top-level `study_id` so fakes and logs can key on it.

pub mod heuristic;
pub mod http_client;

pub use heuristic::HeuristicInferenceClient;
pub use http_client::HttpInferenceClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Inference task requested by a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    FormatDetect,
    FieldMap,
    AutoFix,
    Validate,
    Dedup,
    QualityAssess,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::FormatDetect => "formatDetect",
            TaskType::FieldMap => "fieldMap",
            TaskType::AutoFix => "autoFix",
            TaskType::Validate => "validate",
            TaskType::Dedup => "dedup",
            TaskType::QualityAssess => "qualityAssess",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes reported by the inference boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Call exceeded its deadline (per-study)
    Timeout,
    /// Response did not have the expected shape (per-study)
    Malformed,
    /// Service refused the call for quota reasons (per-study)
    QuotaExceeded,
    /// Service cannot be reached (stage-wide, fatal for the run)
    Unreachable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Malformed => "malformed response",
            FailureKind::QuotaExceeded => "quota exceeded",
            FailureKind::Unreachable => "service unreachable",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct InferenceFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl InferenceFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Malformed, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(FailureKind::QuotaExceeded, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unreachable, message)
    }

    /// True when the failure ends the whole stage rather than one study
    pub fn is_stage_fatal(&self) -> bool {
        self.kind == FailureKind::Unreachable
    }
}

/// Inference client trait - the only way stages reach the reasoning service
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Client identifier for logs (e.g., "http", "heuristic")
    fn name(&self) -> &'static str;

    /// Run one inference task
    ///
    /// # Returns
    /// * `Ok(Value)` - Structured task result (shape depends on `task`)
    /// * `Err(InferenceFailure)` - Typed failure; only `Unreachable` is stage-wide
    async fn infer(
        &self,
        task: TaskType,
        payload: serde_json::Value,
        model_id: &str,
    ) -> Result<serde_json::Value, InferenceFailure>;
}
