//! Progress events published per run
//!
//! Per run: `sequence` starts at 1 and strictly increases; `percent` never
//! decreases. `emitted_at` is metadata only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::issue::Issue;
use super::run::RunStatus;
use super::stage::StageKind;
use super::study::StudyOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    StageStarted,
    StudyCompleted,
    StageCompleted,
    RunFinished,
}

/// What changed for one study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyDelta {
    pub study_id: String,
    pub outcome: StudyOutcome,
    /// Issues added by the current stage
    pub new_issues: Vec<Issue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    pub sequence: u64,
    /// Absent for run-level events
    pub stage: Option<StageKind>,
    pub kind: ProgressKind,
    /// 0-100
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<StudyDelta>,
    /// Terminal status (RunFinished only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressEvent {
    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            ProgressKind::StageStarted => "StageStarted",
            ProgressKind::StudyCompleted => "StudyCompleted",
            ProgressKind::StageCompleted => "StageCompleted",
            ProgressKind::RunFinished => "RunFinished",
        }
    }
}
