//! auto-fix: apply suggested corrections, leaving an audit trail
//!
//! Only studies holding unresolved issues with a non-empty suggestion are
//! sent; everything else passes through without a call. A fix is applied
//! only to a field that one of those issues suggested.

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{decode, BatchView, StudyStage};
use crate::fields;
use crate::inference::{InferenceFailure, TaskType};
use crate::models::{Issue, StageKind, StudyState};

/// `original` is also sent back but the study's own value is what gets audited
#[derive(Debug, Deserialize)]
struct Fix {
    field: String,
    corrected: String,
}

#[derive(Debug, Deserialize)]
struct AutoFixResponse {
    fixes: Vec<Fix>,
}

pub struct AutoFixStage;

impl StudyStage for AutoFixStage {
    const KIND: StageKind = StageKind::AutoFix;
    const TASK: TaskType = TaskType::AutoFix;

    fn build_payload(&self, study: &StudyState, _view: &BatchView) -> Option<serde_json::Value> {
        let suggestions: Vec<serde_json::Value> = study
            .fixable_issue_indices()
            .into_iter()
            .filter_map(|idx| {
                let issue = &study.issues[idx];
                issue.suggestion.as_ref().map(|s| {
                    json!({ "field": s.field, "value": s.value, "message": issue.message })
                })
            })
            .collect();

        if suggestions.is_empty() {
            return None;
        }

        Some(json!({
            "study_id": study.study_id,
            "fields": study.fields,
            "suggestions": suggestions,
        }))
    }

    fn apply(
        &self,
        study: &mut StudyState,
        response: serde_json::Value,
        _view: &BatchView,
    ) -> Result<(), InferenceFailure> {
        let response: AutoFixResponse = decode(Self::KIND, response)?;

        for fix in response.fixes {
            let target = study.fixable_issue_indices().into_iter().find(|&idx| {
                study.issues[idx]
                    .suggestion
                    .as_ref()
                    .is_some_and(|s| s.field == fix.field)
            });
            let Some(idx) = target else {
                debug!(
                    study_id = %study.study_id,
                    field = %fix.field,
                    "Ignoring fix for a field nobody suggested"
                );
                continue;
            };

            let original = study.field_text(&fix.field).unwrap_or_default();
            match fields::coerce(&fix.field, &fix.corrected) {
                Some(value) => {
                    study.fields.insert(fix.field.clone(), value);
                }
                None => {
                    study.fields.remove(&fix.field);
                }
            }
            study.issues[idx].resolved = true;
            study.add_issue(Issue::info(
                Self::KIND,
                format!(
                    "auto-fixed {}: '{}' -> '{}'",
                    fix.field, original, fix.corrected
                ),
            ));
        }
        Ok(())
    }
}
