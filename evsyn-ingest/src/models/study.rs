//! Per-study working state
//!
//! Invariant: once a study is `Failed` it never returns to `Processed` (or any
//! other outcome) within the same run. Failed studies are excluded from later
//! stages but kept for reporting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::issue::{Issue, Severity};
use super::pipeline::InputFormat;

/// Raw record as submitted (column name → cell text)
pub type RawRecord = BTreeMap<String, String>;

/// Normalized fields (canonical name → value)
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// Terminal outcome of a study
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyOutcome {
    Pending,
    Processed,
    Failed,
    /// Excluded because the run was cancelled or halted before it finished
    Cancelled,
}

/// One study moving through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyState {
    /// Stable identity across stages
    pub study_id: String,
    /// 0-based position in the submitted batch
    pub position: usize,
    pub raw: RawRecord,
    pub fields: FieldMap,
    pub issues: Vec<Issue>,
    pub outcome: StudyOutcome,
    pub detected_format: Option<InputFormat>,
    pub quality_score: Option<f64>,
    pub quality_rating: Option<String>,
    /// Study id this record duplicates (earlier in the batch)
    pub duplicate_of: Option<String>,
}

impl StudyState {
    pub fn new(study_id: impl Into<String>, position: usize, raw: RawRecord) -> Self {
        Self {
            study_id: study_id.into(),
            position,
            raw,
            fields: FieldMap::new(),
            issues: Vec::new(),
            outcome: StudyOutcome::Pending,
            detected_format: None,
            quality_score: None,
            quality_rating: None,
            duplicate_of: None,
        }
    }

    /// Still eligible for stages (neither failed nor cancelled)
    pub fn is_active(&self) -> bool {
        matches!(self.outcome, StudyOutcome::Pending | StudyOutcome::Processed)
    }

    /// Record an issue; an error-severity issue fails the study
    pub fn add_issue(&mut self, issue: Issue) {
        if issue.severity == Severity::Error && self.is_active() {
            self.outcome = StudyOutcome::Failed;
        }
        self.issues.push(issue);
    }

    /// Mark processed after a completed stage (no-op unless still active)
    pub fn mark_processed(&mut self) {
        if self.is_active() {
            self.outcome = StudyOutcome::Processed;
        }
    }

    /// Exclude from the rest of the run with an explanatory note
    pub fn mark_cancelled(&mut self, note: Issue) {
        if self.is_active() {
            self.outcome = StudyOutcome::Cancelled;
            self.issues.push(note);
        }
    }

    pub fn has_error(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    /// Indices of unresolved issues carrying a usable suggestion
    pub fn fixable_issue_indices(&self) -> Vec<usize> {
        self.issues
            .iter()
            .enumerate()
            .filter(|(_, issue)| issue.is_fixable())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Field value rendered as text (strings unquoted)
    pub fn field_text(&self, field: &str) -> Option<String> {
        self.fields.get(field).map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}
