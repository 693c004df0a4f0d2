//! Run state machine and read-side views
//!
//! `pending → running → {succeeded | partial_success | failed | cancelled}`.
//! Terminal states are final.

use chrono::{DateTime, Utc};
use evsyn_common::events::OutcomeCounts;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::issue::Issue;
use crate::error::{PipelineError, PipelineResult};
use super::pipeline::InputFormat;
use super::stage::StageKind;
use super::study::{FieldMap, StudyOutcome, StudyState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    PartialSuccess,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::PartialSuccess
                | RunStatus::Succeeded
                | RunStatus::Failed
                | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub run_id: Uuid,
    pub old_status: RunStatus,
    pub new_status: RunStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// One end-to-end processing of a batch
///
/// Written only by the owning run task; everything else reads clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
    /// Declared input format
    pub format: InputFormat,
    pub status: RunStatus,
    /// Planned stages (disabled stages never appear)
    pub stages: Vec<StageKind>,
    /// Index into `stages` of the stage in progress (or last entered)
    pub current_stage: Option<usize>,
    /// One entry per submitted record, in batch order
    pub studies: Vec<StudyState>,
    pub percent: u8,
    /// Explanation for a fatal failure
    pub error: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        pipeline_id: Uuid,
        format: InputFormat,
        stages: Vec<StageKind>,
        studies: Vec<StudyState>,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline_id,
            format,
            status: RunStatus::Pending,
            stages,
            current_stage: None,
            studies,
            percent: 0,
            error: None,
            idempotency_key,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to a new status; a terminal run refuses with `StateError`
    pub fn transition_to(&mut self, new_status: RunStatus) -> PipelineResult<StateTransition> {
        if self.status.is_terminal() {
            return Err(PipelineError::StateError(format!(
                "run {} is already {}, cannot move to {}",
                self.run_id, self.status, new_status
            )));
        }

        let transition = StateTransition {
            run_id: self.run_id,
            old_status: self.status,
            new_status,
            transitioned_at: Utc::now(),
        };
        self.status = new_status;

        if new_status == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(transition.transitioned_at);
        }
        if new_status.is_terminal() {
            self.finished_at = Some(transition.transitioned_at);
        }

        Ok(transition)
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for study in &self.studies {
            match study.outcome {
                StudyOutcome::Pending => counts.pending += 1,
                StudyOutcome::Processed => counts.processed += 1,
                StudyOutcome::Failed => counts.failed += 1,
                StudyOutcome::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Terminal status after every planned stage completed
    pub fn completed_status(&self) -> RunStatus {
        let counts = self.counts();
        if counts.failed == 0 {
            RunStatus::Succeeded
        } else if counts.processed > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Failed
        }
    }

    /// Clones of the studies still eligible for stages, in batch order
    pub fn active_studies(&self) -> Vec<StudyState> {
        self.studies
            .iter()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    /// Write stage output back by batch position
    pub fn merge_studies(&mut self, updated: Vec<StudyState>) {
        for study in updated {
            let position = study.position;
            if let Some(slot) = self.studies.get_mut(position) {
                *slot = study;
            }
        }
    }

    pub fn current_stage_kind(&self) -> Option<StageKind> {
        self.current_stage.and_then(|idx| self.stages.get(idx).copied())
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            pipeline_id: self.pipeline_id,
            format: self.format,
            status: self.status,
            stages: self.stages.clone(),
            current_stage: self.current_stage_kind(),
            counts: self.counts(),
            percent: self.percent,
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    pub fn result(&self) -> RunResult {
        let studies: Vec<StudyReport> = self.studies.iter().map(StudyReport::from).collect();
        let failures = self
            .studies
            .iter()
            .filter(|s| s.outcome == StudyOutcome::Failed)
            .map(|s| StudyFailure {
                study_id: s.study_id.clone(),
                issues: s.issues.clone(),
            })
            .collect();

        RunResult {
            run_id: self.run_id,
            pipeline_id: self.pipeline_id,
            status: self.status,
            counts: self.counts(),
            error: self.error.clone(),
            studies,
            failures,
        }
    }
}

/// Point-in-time status view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
    pub format: InputFormat,
    pub status: RunStatus,
    pub stages: Vec<StageKind>,
    pub current_stage: Option<StageKind>,
    pub counts: OutcomeCounts,
    pub percent: u8,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-study outcome as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyReport {
    pub study_id: String,
    pub position: usize,
    pub outcome: StudyOutcome,
    pub fields: FieldMap,
    pub issues: Vec<Issue>,
    pub detected_format: Option<InputFormat>,
    pub quality_score: Option<f64>,
    pub quality_rating: Option<String>,
    pub duplicate_of: Option<String>,
}

impl From<&StudyState> for StudyReport {
    fn from(study: &StudyState) -> Self {
        Self {
            study_id: study.study_id.clone(),
            position: study.position,
            outcome: study.outcome,
            fields: study.fields.clone(),
            issues: study.issues.clone(),
            detected_format: study.detected_format,
            quality_score: study.quality_score,
            quality_rating: study.quality_rating.clone(),
            duplicate_of: study.duplicate_of.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyFailure {
    pub study_id: String,
    pub issues: Vec<Issue>,
}

/// Final output of a terminal run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
    pub status: RunStatus,
    pub counts: OutcomeCounts,
    pub error: Option<String>,
    pub studies: Vec<StudyReport>,
    /// Exactly the failed studies, with their issues
    pub failures: Vec<StudyFailure>,
}
