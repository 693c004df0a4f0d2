//! One end-to-end processing of a batch
//!
//! The run task is the only writer of a run's state. It works on a local copy
//! and publishes it to readers at each stage boundary, so readers always see a
//! consistent snapshot.
//!
//! Terminal status:
//! - every stage completed: `succeeded` (no failures), `partial_success`
//!   (some processed, some failed) or `failed` (nothing processed)
//! - stage-wide fatal error: `failed` with `error` set; studies that failed in
//!   the aborted stage keep that failure, the rest of its partial output is
//!   discarded and studies still pending become cancelled
//! - cancellation seen at a stage boundary: `cancelled`; every study that had
//!   not failed becomes cancelled

use chrono::{DateTime, Utc};
use evsyn_common::events::{EventBus, ServiceEvent};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::progress_channel::{ProgressChannel, ProgressSubscription, ProgressTracker};
use crate::error::{PipelineError, PipelineResult};
use crate::inference::InferenceClient;
use crate::models::{
    Issue, Pipeline, Run, RunResult, RunSnapshot, RunStatus, StageKind, StudyOutcome,
};
use crate::stages::{build_executor, RunContext, StageFailure, StageSettings};

/// Shared handle to a run: published state, progress channel, cancel token
pub struct RunHandle {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
    pub idempotency_key: Option<String>,
    state: RwLock<Run>,
    progress: Arc<ProgressChannel>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn new(run: Run, subscriber_buffer: usize) -> Self {
        Self {
            run_id: run.run_id,
            pipeline_id: run.pipeline_id,
            idempotency_key: run.idempotency_key.clone(),
            progress: Arc::new(ProgressChannel::new(run.run_id, subscriber_buffer)),
            state: RwLock::new(run),
            cancel: CancellationToken::new(),
        }
    }

    /// Copy of the current run state
    pub async fn run(&self) -> Run {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> RunStatus {
        self.state.read().await.status
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        self.state.read().await.snapshot()
    }

    pub async fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.finished_at
    }

    /// Final result; `NotReady` until the run is terminal
    pub async fn result(&self) -> PipelineResult<RunResult> {
        let run = self.state.read().await;
        if !run.status.is_terminal() {
            return Err(PipelineError::NotReady(self.run_id));
        }
        Ok(run.result())
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> &Arc<ProgressChannel> {
        &self.progress
    }

    /// Ask the run to stop at its next stage boundary
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn publish(&self, run: &Run) {
        *self.state.write().await = run.clone();
    }
}

/// Run task: sequences the planned stages over the batch
pub struct PipelineRun {
    handle: Arc<RunHandle>,
    pipeline: Arc<Pipeline>,
    client: Arc<dyn InferenceClient>,
    settings: StageSettings,
    event_bus: EventBus,
}

enum Ending {
    Completed,
    Cancelled,
    Fatal,
}

impl PipelineRun {
    pub fn new(
        handle: Arc<RunHandle>,
        pipeline: Arc<Pipeline>,
        client: Arc<dyn InferenceClient>,
        settings: StageSettings,
        event_bus: EventBus,
    ) -> Self {
        Self {
            handle,
            pipeline,
            client,
            settings,
            event_bus,
        }
    }

    /// Drive the run to a terminal state and return it
    pub async fn execute(self) -> RunStatus {
        let handle = self.handle.clone();
        let mut run = handle.run().await;
        let run_id = run.run_id;

        if let Err(err) = run.transition_to(RunStatus::Running) {
            warn!(run_id = %run_id, error = %err, "Run not started");
            return run.status;
        }
        handle.publish(&run).await;

        info!(
            run_id = %run_id,
            pipeline_id = %run.pipeline_id,
            studies = run.studies.len(),
            stages = ?run.stages,
            client = self.client.name(),
            "Run started"
        );

        let mut tracker = ProgressTracker::new(handle.progress.clone(), run.stages.len());
        let stages = run.stages.clone();
        let mut ending = Ending::Completed;

        for (idx, kind) in stages.iter().copied().enumerate() {
            if handle.is_cancel_requested() {
                info!(run_id = %run_id, stage = %kind, "Cancellation observed at stage boundary");
                cancel_remaining(&mut run, kind);
                ending = Ending::Cancelled;
                break;
            }

            let input = run.active_studies();
            if input.is_empty() {
                info!(run_id = %run_id, stage = %kind, "No active studies left, skipping remaining stages");
                break;
            }

            run.current_stage = Some(idx);
            handle.publish(&run).await;

            let executor = build_executor(kind);
            let mut ctx = RunContext {
                run_id,
                model_id: self.pipeline.model_id.clone(),
                declared_format: run.format,
                client: self.client.clone(),
                settings: self.settings.clone(),
                progress: &mut tracker,
            };

            match executor.execute(input, &mut ctx).await {
                Ok(result) => {
                    run.merge_studies(result.updated);
                    run.percent = tracker.percent();
                    handle.publish(&run).await;
                }
                Err(StageFailure::Fatal {
                    stage,
                    failure,
                    failed,
                }) => {
                    error!(
                        run_id = %run_id,
                        stage = %stage,
                        error = %failure,
                        "Stage failed fatally, aborting run"
                    );
                    run.error = Some(format!("stage {} aborted: {}", stage, failure));
                    run.merge_studies(failed);
                    cancel_pending(&mut run, stage);
                    ending = Ending::Fatal;
                    break;
                }
            }
        }

        let status = match ending {
            Ending::Completed => run.completed_status(),
            Ending::Cancelled => RunStatus::Cancelled,
            Ending::Fatal => RunStatus::Failed,
        };
        if let Err(err) = run.transition_to(status) {
            error!(run_id = %run_id, error = %err, "Terminal transition refused");
        }
        run.percent = 100;
        handle.publish(&run).await;

        tracker.run_finished(status);
        handle.progress.close();

        let counts = run.counts();
        info!(
            run_id = %run_id,
            status = %status,
            processed = counts.processed,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "Run finished"
        );

        self.event_bus.emit_lossy(ServiceEvent::RunFinished {
            run_id,
            pipeline_id: run.pipeline_id,
            status: status.as_str().to_string(),
            counts,
            error: run.error.clone(),
            timestamp: Utc::now(),
        });

        status
    }
}

/// Cancel every study that has not failed
fn cancel_remaining(run: &mut Run, next_stage: StageKind) {
    for study in &mut run.studies {
        study.mark_cancelled(Issue::info(
            next_stage,
            format!("run cancelled before stage {}", next_stage),
        ));
    }
}

/// Cancel studies that never completed a stage
fn cancel_pending(run: &mut Run, failed_stage: StageKind) {
    for study in &mut run.studies {
        if study.outcome == StudyOutcome::Pending {
            study.mark_cancelled(Issue::info(
                failed_stage,
                format!("not processed: stage {} aborted", failed_stage),
            ));
        }
    }
}
