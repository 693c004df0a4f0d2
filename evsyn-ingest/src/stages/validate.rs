//! validate: statistical plausibility checks on normalized fields

use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;

use super::{decode, BatchView, ReportedIssue, StudyStage};
use crate::inference::{InferenceFailure, TaskType};
use crate::models::{StageKind, StudyState};

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    issues: Vec<ReportedIssue>,
}

pub struct ValidateStage;

impl StudyStage for ValidateStage {
    const KIND: StageKind = StageKind::Validate;
    const TASK: TaskType = TaskType::Validate;

    fn build_payload(&self, study: &StudyState, _view: &BatchView) -> Option<serde_json::Value> {
        // Fields with an open fix suggestion are already reported
        let pending_fixes: BTreeSet<&str> = study
            .issues
            .iter()
            .filter(|issue| issue.is_fixable())
            .filter_map(|issue| issue.suggestion.as_ref())
            .map(|suggestion| suggestion.field.as_str())
            .collect();
        Some(json!({
            "study_id": study.study_id,
            "fields": study.fields,
            "pending_fixes": pending_fixes,
        }))
    }

    fn apply(
        &self,
        study: &mut StudyState,
        response: serde_json::Value,
        _view: &BatchView,
    ) -> Result<(), InferenceFailure> {
        let response: ValidateResponse = decode(Self::KIND, response)?;
        for issue in response.issues {
            study.add_issue(issue.into_issue(Self::KIND));
        }
        Ok(())
    }
}
