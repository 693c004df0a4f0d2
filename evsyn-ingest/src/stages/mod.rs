//! Stage executors
//!
//! Each stage runs over the studies still active in a run. Per-study work is
//! dispatched to the inference client with bounded concurrency
//! (`futures::stream::buffer_unordered`) and a per-call timeout; results are
//! applied by batch position so output order never depends on completion
//! order.
//!
//! Failure isolation:
//! - timeout, malformed response, quota → `error` issue on that study only
//! - unreachable service → `StageFailure::Fatal`; responses arriving after it
//!   are not applied, and only the studies that already failed in the stage
//!   are handed back with it

mod auto_fix;
mod dedup;
mod format_detect;
mod parse;
mod quality;
mod validate;

pub use auto_fix::AutoFixStage;
pub use dedup::DedupStage;
pub use format_detect::FormatDetectStage;
pub use parse::ParseStage;
pub use quality::QualityAssessStage;
pub use validate::ValidateStage;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::inference::{InferenceClient, InferenceFailure, TaskType};
use crate::models::{
    FieldMap, InputFormat, Issue, ProgressEvent, Severity, StageKind, StudyDelta, StudyOutcome,
    StudyState, Suggestion,
};
use crate::workflow::ProgressTracker;

/// Tunables shared by every stage of a run
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub max_concurrent_calls: usize,
    pub call_timeout: Duration,
    pub duplicate_threshold: f64,
    pub quality_floor: f64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 4,
            call_timeout: Duration::from_secs(30),
            duplicate_threshold: 0.9,
            quality_floor: 0.4,
        }
    }
}

/// Everything a stage needs from its run
pub struct RunContext<'a> {
    pub run_id: Uuid,
    pub model_id: String,
    pub declared_format: InputFormat,
    pub client: Arc<dyn InferenceClient>,
    pub settings: StageSettings,
    pub progress: &'a mut ProgressTracker,
}

/// Output of a completed stage
#[derive(Debug)]
pub struct StageResult {
    /// Same studies as the input, same order
    pub updated: Vec<StudyState>,
    /// Progress events emitted while the stage ran
    pub events: Vec<ProgressEvent>,
}

#[derive(Debug, Clone, Error)]
pub enum StageFailure {
    /// Stage-wide failure; the run cannot continue
    #[error("stage {stage} aborted: {failure}")]
    Fatal {
        stage: StageKind,
        failure: InferenceFailure,
        /// Studies that failed in this stage before it aborted, with their issues
        failed: Vec<StudyState>,
    },
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Run the stage over the active studies of a run
    async fn execute(
        &self,
        input: Vec<StudyState>,
        ctx: &mut RunContext<'_>,
    ) -> Result<StageResult, StageFailure>;
}

/// Executor for a planned stage
pub fn build_executor(kind: StageKind) -> Box<dyn StageExecutor> {
    match kind {
        StageKind::FormatDetect => Box::new(FormatDetectStage),
        StageKind::Parse => Box::new(ParseStage),
        StageKind::AutoFix => Box::new(AutoFixStage),
        StageKind::Validate => Box::new(ValidateStage),
        StageKind::Dedup => Box::new(DedupStage),
        StageKind::QualityAssess => Box::new(QualityAssessStage),
    }
}

/// Result of one per-study call, as a value rather than an error
#[derive(Debug)]
pub enum StudyCallOutcome {
    Completed(serde_json::Value),
    Failed(InferenceFailure),
    /// Skipped because the stage was already halted by a fatal failure
    NotDispatched,
}

/// Read-only view of the stage input, built before dispatch
pub struct BatchView {
    pub declared_format: InputFormat,
    pub duplicate_threshold: f64,
    pub quality_floor: f64,
    /// study_id → batch position
    pub positions: HashMap<String, usize>,
    /// (study_id, fields) of every active study, batch order
    pub peers: Vec<(String, FieldMap)>,
}

impl BatchView {
    fn new(input: &[StudyState], ctx: &RunContext<'_>) -> Self {
        Self {
            declared_format: ctx.declared_format,
            duplicate_threshold: ctx.settings.duplicate_threshold,
            quality_floor: ctx.settings.quality_floor,
            positions: input
                .iter()
                .map(|s| (s.study_id.clone(), s.position))
                .collect(),
            peers: input
                .iter()
                .map(|s| (s.study_id.clone(), s.fields.clone()))
                .collect(),
        }
    }
}

/// Per-study stage behaviour; the dispatch loop is shared
pub trait StudyStage: Send + Sync {
    const KIND: StageKind;
    const TASK: TaskType;

    /// Payload for one study, or None to pass the study through untouched
    fn build_payload(&self, study: &StudyState, view: &BatchView) -> Option<serde_json::Value>;

    /// Apply a response; an unexpected shape is reported as `Malformed`
    ///
    /// Implementations decode the whole response before touching `study`.
    fn apply(
        &self,
        study: &mut StudyState,
        response: serde_json::Value,
        view: &BatchView,
    ) -> Result<(), InferenceFailure>;
}

/// Decode a typed response, mapping shape errors to `Malformed`
pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    kind: StageKind,
    response: serde_json::Value,
) -> Result<T, InferenceFailure> {
    serde_json::from_value(response)
        .map_err(|e| InferenceFailure::malformed(format!("unexpected {} response: {}", kind, e)))
}

/// Issue as returned by the inference service
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ReportedIssue {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub suggestion: Option<Suggestion>,
    #[serde(default)]
    pub requires_manual_review: bool,
}

impl ReportedIssue {
    pub fn into_issue(self, stage: StageKind) -> Issue {
        let mut issue = Issue::new(stage, self.severity, self.message);
        issue.suggestion = self.suggestion;
        issue.requires_manual_review = self.requires_manual_review;
        issue
    }
}

fn call_failure_issue(stage: StageKind, failure: &InferenceFailure) -> Issue {
    Issue::error(stage, format!("{} failed: {}", stage, failure))
}

/// Outcome a study will carry if the stage completes
fn projected_outcome(study: &StudyState) -> StudyOutcome {
    if study.is_active() {
        StudyOutcome::Processed
    } else {
        study.outcome
    }
}

#[async_trait]
impl<S: StudyStage + 'static> StageExecutor for S {
    fn kind(&self) -> StageKind {
        S::KIND
    }

    async fn execute(
        &self,
        input: Vec<StudyState>,
        ctx: &mut RunContext<'_>,
    ) -> Result<StageResult, StageFailure> {
        let kind = S::KIND;
        let view = BatchView::new(&input, ctx);
        let mut studies = input;

        let calls: Vec<(usize, serde_json::Value)> = studies
            .iter()
            .enumerate()
            .filter_map(|(idx, study)| self.build_payload(study, &view).map(|p| (idx, p)))
            .collect();

        let mut events = vec![ctx.progress.stage_started(kind, calls.len())];
        info!(
            run_id = %ctx.run_id,
            stage = %kind,
            studies = studies.len(),
            calls = calls.len(),
            "Stage started"
        );

        let client = ctx.client.clone();
        let model_id = ctx.model_id.clone();
        let call_timeout = ctx.settings.call_timeout;
        let limit = ctx.settings.max_concurrent_calls.max(1);
        let halted = Arc::new(AtomicBool::new(false));

        let mut outcomes = stream::iter(calls)
            .map(|(idx, payload)| {
                let client = client.clone();
                let model_id = model_id.clone();
                let halted = halted.clone();
                async move {
                    if halted.load(Ordering::Acquire) {
                        return (idx, StudyCallOutcome::NotDispatched);
                    }
                    let outcome =
                        match tokio::time::timeout(call_timeout, client.infer(S::TASK, payload, &model_id))
                            .await
                        {
                            Ok(Ok(response)) => StudyCallOutcome::Completed(response),
                            Ok(Err(failure)) => {
                                if failure.is_stage_fatal() {
                                    halted.store(true, Ordering::Release);
                                }
                                StudyCallOutcome::Failed(failure)
                            }
                            Err(_) => StudyCallOutcome::Failed(InferenceFailure::timeout(format!(
                                "no response within {} ms",
                                call_timeout.as_millis()
                            ))),
                        };
                    (idx, outcome)
                }
            })
            .buffer_unordered(limit);

        let mut fatal: Option<InferenceFailure> = None;

        let mut failed_in_stage: Vec<usize> = Vec::new();

        while let Some((idx, outcome)) = outcomes.next().await {
            if fatal.is_some() {
                continue;
            }
            let study = &mut studies[idx];
            let issues_before = study.issues.len();

            match outcome {
                StudyCallOutcome::Completed(response) => {
                    if let Err(failure) = self.apply(study, response, &view) {
                        warn!(
                            run_id = %ctx.run_id,
                            stage = %kind,
                            study_id = %study.study_id,
                            error = %failure,
                            "Study failed"
                        );
                        study.add_issue(call_failure_issue(kind, &failure));
                    }
                }
                StudyCallOutcome::Failed(failure) if failure.is_stage_fatal() => {
                    fatal = Some(failure);
                    continue;
                }
                StudyCallOutcome::Failed(failure) => {
                    warn!(
                        run_id = %ctx.run_id,
                        stage = %kind,
                        study_id = %study.study_id,
                        error = %failure,
                        "Study failed"
                    );
                    study.add_issue(call_failure_issue(kind, &failure));
                }
                StudyCallOutcome::NotDispatched => continue,
            }

            if study.outcome == StudyOutcome::Failed {
                failed_in_stage.push(idx);
            }

            debug!(
                run_id = %ctx.run_id,
                stage = %kind,
                study_id = %study.study_id,
                new_issues = study.issues.len() - issues_before,
                "Study completed stage"
            );
            let delta = StudyDelta {
                study_id: study.study_id.clone(),
                outcome: projected_outcome(study),
                new_issues: study.issues[issues_before..].to_vec(),
            };
            events.push(ctx.progress.study_completed(kind, delta));
        }

        if let Some(failure) = fatal {
            let failed = failed_in_stage
                .into_iter()
                .map(|idx| studies[idx].clone())
                .collect();
            return Err(StageFailure::Fatal {
                stage: kind,
                failure,
                failed,
            });
        }

        for study in &mut studies {
            study.mark_processed();
        }

        let failed = studies
            .iter()
            .filter(|s| s.outcome == StudyOutcome::Failed)
            .count();
        info!(
            run_id = %ctx.run_id,
            stage = %kind,
            failed,
            "Stage completed"
        );
        events.push(ctx.progress.stage_completed(kind));

        Ok(StageResult {
            updated: studies,
            events,
        })
    }
}
