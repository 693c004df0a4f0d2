//! format-detect: confirm the declared input format per record

use serde::Deserialize;
use serde_json::json;

use super::{decode, BatchView, ReportedIssue, StudyStage};
use crate::inference::{InferenceFailure, TaskType};
use crate::models::{InputFormat, Issue, StageKind, StudyState};

#[derive(Debug, Deserialize)]
struct FormatResponse {
    format: String,
    confidence: f64,
    #[serde(default)]
    issues: Vec<ReportedIssue>,
}

pub struct FormatDetectStage;

impl StudyStage for FormatDetectStage {
    const KIND: StageKind = StageKind::FormatDetect;
    const TASK: TaskType = TaskType::FormatDetect;

    fn build_payload(&self, study: &StudyState, view: &BatchView) -> Option<serde_json::Value> {
        Some(json!({
            "study_id": study.study_id,
            "declared_format": view.declared_format,
            "record": study.raw,
        }))
    }

    fn apply(
        &self,
        study: &mut StudyState,
        response: serde_json::Value,
        view: &BatchView,
    ) -> Result<(), InferenceFailure> {
        let response: FormatResponse = decode(Self::KIND, response)?;
        let detected = InputFormat::parse(&response.format).ok_or_else(|| {
            InferenceFailure::malformed(format!("unknown format '{}'", response.format))
        })?;
        if !(0.0..=1.0).contains(&response.confidence) {
            return Err(InferenceFailure::malformed(format!(
                "confidence {} outside 0-1",
                response.confidence
            )));
        }

        study.detected_format = Some(detected);
        if detected != view.declared_format {
            study.add_issue(Issue::warning(
                Self::KIND,
                format!(
                    "detected format {} (confidence {:.2}) differs from declared {}",
                    detected, response.confidence, view.declared_format
                ),
            ));
        }
        for issue in response.issues {
            study.add_issue(issue.into_issue(Self::KIND));
        }
        Ok(())
    }
}
