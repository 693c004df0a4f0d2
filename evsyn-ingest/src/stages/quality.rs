//! quality-assess: score each study and flag low scores for review

use serde::Deserialize;
use serde_json::json;

use super::{decode, BatchView, ReportedIssue, StudyStage};
use crate::inference::{InferenceFailure, TaskType};
use crate::models::{Issue, StageKind, StudyState};

#[derive(Debug, Deserialize)]
struct QualityResponse {
    score: f64,
    #[serde(default)]
    rating: Option<String>,
    #[serde(default)]
    issues: Vec<ReportedIssue>,
}

pub struct QualityAssessStage;

impl StudyStage for QualityAssessStage {
    const KIND: StageKind = StageKind::QualityAssess;
    const TASK: TaskType = TaskType::QualityAssess;

    fn build_payload(&self, study: &StudyState, _view: &BatchView) -> Option<serde_json::Value> {
        Some(json!({
            "study_id": study.study_id,
            "fields": study.fields,
        }))
    }

    fn apply(
        &self,
        study: &mut StudyState,
        response: serde_json::Value,
        view: &BatchView,
    ) -> Result<(), InferenceFailure> {
        let response: QualityResponse = decode(Self::KIND, response)?;
        if !(0.0..=1.0).contains(&response.score) {
            return Err(InferenceFailure::malformed(format!(
                "quality score {} outside 0-1",
                response.score
            )));
        }

        study.quality_score = Some(response.score);
        study.quality_rating = response.rating;
        if response.score < view.quality_floor {
            study.add_issue(
                Issue::warning(
                    Self::KIND,
                    format!(
                        "quality score {:.2} is below the floor {:.2}",
                        response.score, view.quality_floor
                    ),
                )
                .needing_review(),
            );
        }
        for issue in response.issues {
            study.add_issue(issue.into_issue(Self::KIND));
        }
        Ok(())
    }
}
