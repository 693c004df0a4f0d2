//! parse: map raw columns onto canonical fields

use serde::Deserialize;
use serde_json::json;

use super::{decode, BatchView, ReportedIssue, StudyStage};
use crate::inference::{InferenceFailure, TaskType};
use crate::models::{FieldMap, Issue, StageKind, StudyState};

#[derive(Debug, Deserialize)]
struct FieldMapResponse {
    fields: FieldMap,
    #[serde(default)]
    unmapped: Vec<String>,
    #[serde(default)]
    issues: Vec<ReportedIssue>,
}

pub struct ParseStage;

impl StudyStage for ParseStage {
    const KIND: StageKind = StageKind::Parse;
    const TASK: TaskType = TaskType::FieldMap;

    fn build_payload(&self, study: &StudyState, _view: &BatchView) -> Option<serde_json::Value> {
        Some(json!({
            "study_id": study.study_id,
            "record": study.raw,
        }))
    }

    fn apply(
        &self,
        study: &mut StudyState,
        response: serde_json::Value,
        _view: &BatchView,
    ) -> Result<(), InferenceFailure> {
        let response: FieldMapResponse = decode(Self::KIND, response)?;

        study.fields = response.fields;
        if !response.unmapped.is_empty() {
            study.add_issue(Issue::info(
                Self::KIND,
                format!("unmapped columns: {}", response.unmapped.join(", ")),
            ));
        }
        for issue in response.issues {
            study.add_issue(issue.into_issue(Self::KIND));
        }
        Ok(())
    }
}
