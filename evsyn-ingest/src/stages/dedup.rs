//! dedup: flag later records that duplicate an earlier one
//!
//! A claim against a later study (batch order) is ignored so that the
//! earlier record survives.

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{decode, BatchView, StudyStage};
use crate::inference::{InferenceFailure, TaskType};
use crate::models::{Issue, StageKind, StudyState};

#[derive(Debug, Deserialize)]
struct DedupResponse {
    #[serde(default)]
    duplicate_of: Option<String>,
    confidence: f64,
}

pub struct DedupStage;

impl StudyStage for DedupStage {
    const KIND: StageKind = StageKind::Dedup;
    const TASK: TaskType = TaskType::Dedup;

    fn build_payload(&self, study: &StudyState, view: &BatchView) -> Option<serde_json::Value> {
        let candidates: Vec<serde_json::Value> = view
            .peers
            .iter()
            .filter(|(id, _)| *id != study.study_id)
            .map(|(id, fields)| json!({ "study_id": id, "fields": fields }))
            .collect();

        Some(json!({
            "study_id": study.study_id,
            "fields": study.fields,
            "candidates": candidates,
        }))
    }

    fn apply(
        &self,
        study: &mut StudyState,
        response: serde_json::Value,
        view: &BatchView,
    ) -> Result<(), InferenceFailure> {
        let response: DedupResponse = decode(Self::KIND, response)?;
        if !(0.0..=1.0).contains(&response.confidence) {
            return Err(InferenceFailure::malformed(format!(
                "confidence {} outside 0-1",
                response.confidence
            )));
        }

        let Some(other) = response.duplicate_of else {
            return Ok(());
        };
        let Some(&other_position) = view.positions.get(&other) else {
            debug!(study_id = %study.study_id, claimed = %other, "Duplicate claim names an unknown study");
            return Ok(());
        };
        if other_position >= study.position {
            return Ok(());
        }

        study.duplicate_of = Some(other.clone());
        let issue = if response.confidence >= view.duplicate_threshold {
            Issue::error(
                Self::KIND,
                format!(
                    "duplicate of {} (confidence {:.2})",
                    other, response.confidence
                ),
            )
        } else {
            Issue::warning(
                Self::KIND,
                format!(
                    "possible duplicate of {} (confidence {:.2})",
                    other, response.confidence
                ),
            )
        };
        study.add_issue(issue.needing_review());
        Ok(())
    }
}
