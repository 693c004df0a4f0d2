//! Process-scoped table of pipelines and runs
//!
//! Constructed explicitly (one per service, one per test). Lock order is
//! always `pipelines` before `runs`.
//!
//! Retention:
//! - completed runs beyond `max_retained_runs` are evicted oldest-finished first
//! - completed runs finished longer than `run_ttl` ago are evicted
//! - pipelines idle for `pipeline_ttl` with no retained runs are evicted

use chrono::{DateTime, Utc};
use evsyn_common::events::{EventBus, ServiceEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::input::{build_studies, decode_batch, RawBatch};
use super::pipeline_run::{PipelineRun, RunHandle};
use super::progress_channel::ProgressSubscription;
use crate::error::{PipelineError, PipelineResult};
use crate::inference::InferenceClient;
use crate::models::{
    InputFormat, Pipeline, PipelineConfig, Run, RunResult, RunSnapshot, RunStatus,
};
use crate::stages::StageSettings;

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_retained_runs: usize,
    pub run_ttl: Duration,
    pub pipeline_ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_retained_runs: 100,
            run_ttl: Duration::from_secs(3_600),
            pipeline_ttl: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Model used when a pipeline names none
    pub default_model: String,
    pub stage: StageSettings,
    pub subscriber_buffer: usize,
    pub retention: RetentionPolicy,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_model: "evsyn-default".to_string(),
            stage: StageSettings::default(),
            subscriber_buffer: 256,
            retention: RetentionPolicy::default(),
        }
    }
}

/// What one eviction pass removed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    pub runs: Vec<Uuid>,
    pub pipelines: Vec<Uuid>,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty() && self.pipelines.is_empty()
    }
}

struct PipelineEntry {
    pipeline: Arc<Pipeline>,
    last_used: DateTime<Utc>,
}

pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<Uuid, PipelineEntry>>,
    runs: RwLock<HashMap<Uuid, Arc<RunHandle>>>,
    client: Arc<dyn InferenceClient>,
    settings: RegistrySettings,
    event_bus: EventBus,
}

/// Out-of-range TTLs are capped at a century
fn chrono_duration(duration: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(duration)
        .map(|d| d.min(cap))
        .unwrap_or(cap)
}

impl PipelineRegistry {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        settings: RegistrySettings,
        event_bus: EventBus,
    ) -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            client,
            settings,
            event_bus,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn client_name(&self) -> &'static str {
        self.client.name()
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    pub async fn create_pipeline(&self, config: PipelineConfig) -> PipelineResult<Pipeline> {
        let pipeline = Pipeline::from_config(config, &self.settings.default_model)?;

        self.pipelines.write().await.insert(
            pipeline.pipeline_id,
            PipelineEntry {
                pipeline: Arc::new(pipeline.clone()),
                last_used: pipeline.created_at,
            },
        );

        info!(
            pipeline_id = %pipeline.pipeline_id,
            project_id = %pipeline.project_id,
            model_id = %pipeline.model_id,
            "Pipeline created"
        );
        self.event_bus.emit_lossy(ServiceEvent::PipelineCreated {
            pipeline_id: pipeline.pipeline_id,
            project_id: pipeline.project_id.clone(),
            timestamp: Utc::now(),
        });

        Ok(pipeline)
    }

    pub async fn get_pipeline(&self, pipeline_id: Uuid) -> PipelineResult<Pipeline> {
        self.pipelines
            .read()
            .await
            .get(&pipeline_id)
            .map(|entry| entry.pipeline.as_ref().clone())
            .ok_or(PipelineError::PipelineNotFound(pipeline_id))
    }

    /// All pipelines, oldest first
    pub async fn list_pipelines(&self) -> Vec<Pipeline> {
        let mut pipelines: Vec<Pipeline> = self
            .pipelines
            .read()
            .await
            .values()
            .map(|entry| entry.pipeline.as_ref().clone())
            .collect();
        pipelines.sort_by_key(|p| p.created_at);
        pipelines
    }

    /// Remove a pipeline; its in-flight runs are asked to cancel
    pub async fn delete_pipeline(&self, pipeline_id: Uuid) -> PipelineResult<()> {
        if self.pipelines.write().await.remove(&pipeline_id).is_none() {
            return Err(PipelineError::PipelineNotFound(pipeline_id));
        }

        let runs = self.runs.read().await;
        let mut cancelled = 0;
        for handle in runs.values().filter(|h| h.pipeline_id == pipeline_id) {
            if !handle.status().await.is_terminal() {
                handle.request_cancel();
                cancelled += 1;
            }
        }
        drop(runs);

        info!(pipeline_id = %pipeline_id, cancelled_runs = cancelled, "Pipeline deleted");
        self.event_bus.emit_lossy(ServiceEvent::PipelineDeleted {
            pipeline_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Accept a batch and spawn its run task
    ///
    /// With an `idempotency_key`, a repeat start on the same pipeline returns
    /// the existing run id.
    pub async fn start_run(
        &self,
        pipeline_id: Uuid,
        format: InputFormat,
        batch: RawBatch,
        idempotency_key: Option<String>,
    ) -> PipelineResult<Uuid> {
        let pipeline = {
            let mut pipelines = self.pipelines.write().await;
            let entry = pipelines.get_mut(&pipeline_id).ok_or_else(|| {
                PipelineError::InvalidConfiguration(format!("unknown pipeline {}", pipeline_id))
            })?;
            entry.last_used = Utc::now();
            entry.pipeline.clone()
        };

        let idempotency_key = idempotency_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        let records = decode_batch(batch)?;
        let studies = build_studies(records);
        let study_count = studies.len();

        let mut runs = self.runs.write().await;
        if let Some(key) = &idempotency_key {
            if let Some(existing) = runs.values().find(|h| {
                h.pipeline_id == pipeline_id && h.idempotency_key.as_deref() == Some(key.as_str())
            }) {
                debug!(run_id = %existing.run_id, key = %key, "Idempotent start, returning existing run");
                return Ok(existing.run_id);
            }
        }

        let run = Run::new(
            pipeline_id,
            format,
            pipeline.stage_plan(),
            studies,
            idempotency_key,
        );
        let run_id = run.run_id;
        let handle = Arc::new(RunHandle::new(run, self.settings.subscriber_buffer));
        runs.insert(run_id, handle.clone());
        drop(runs);

        info!(
            run_id = %run_id,
            pipeline_id = %pipeline_id,
            format = %format,
            studies = study_count,
            "Run accepted"
        );
        self.event_bus.emit_lossy(ServiceEvent::RunStarted {
            run_id,
            pipeline_id,
            study_count,
            timestamp: Utc::now(),
        });

        let task = PipelineRun::new(
            handle,
            pipeline,
            self.client.clone(),
            self.settings.stage.clone(),
            self.event_bus.clone(),
        );
        tokio::spawn(task.execute());

        Ok(run_id)
    }

    async fn handle(&self, run_id: Uuid) -> PipelineResult<Arc<RunHandle>> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    /// Request cancellation; a terminal run is left unchanged
    pub async fn cancel(&self, run_id: Uuid) -> PipelineResult<RunStatus> {
        let handle = self.handle(run_id).await?;
        let status = handle.status().await;
        if status.is_terminal() {
            debug!(run_id = %run_id, status = %status, "Cancel on terminal run ignored");
            return Ok(status);
        }
        handle.request_cancel();
        info!(run_id = %run_id, "Run cancellation requested");
        Ok(status)
    }

    pub async fn get_status(&self, run_id: Uuid) -> PipelineResult<RunSnapshot> {
        Ok(self.handle(run_id).await?.snapshot().await)
    }

    pub async fn get_result(&self, run_id: Uuid) -> PipelineResult<RunResult> {
        self.handle(run_id).await?.result().await
    }

    /// Full run state including raw records
    pub async fn get_run(&self, run_id: Uuid) -> PipelineResult<Run> {
        Ok(self.handle(run_id).await?.run().await)
    }

    pub async fn subscribe(&self, run_id: Uuid) -> PipelineResult<ProgressSubscription> {
        Ok(self.handle(run_id).await?.subscribe())
    }

    /// Runs of one pipeline, oldest first
    pub async fn list_runs(&self, pipeline_id: Uuid) -> PipelineResult<Vec<RunSnapshot>> {
        if !self.pipelines.read().await.contains_key(&pipeline_id) {
            return Err(PipelineError::PipelineNotFound(pipeline_id));
        }

        let handles: Vec<Arc<RunHandle>> = self
            .runs
            .read()
            .await
            .values()
            .filter(|h| h.pipeline_id == pipeline_id)
            .cloned()
            .collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.snapshot().await);
        }
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    /// Wait for the run to finish and return its result
    pub async fn await_result(&self, run_id: Uuid) -> PipelineResult<RunResult> {
        let mut subscription = self.subscribe(run_id).await?;
        while subscription.recv().await.is_some() {}
        self.get_result(run_id).await
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    pub async fn evict_expired(&self, now: DateTime<Utc>) -> EvictionReport {
        let retention = &self.settings.retention;
        let mut pipelines = self.pipelines.write().await;
        let mut runs = self.runs.write().await;

        let mut finished: Vec<(Uuid, DateTime<Utc>)> = Vec::new();
        for (id, handle) in runs.iter() {
            if let Some(finished_at) = handle.finished_at().await {
                finished.push((*id, finished_at));
            }
        }
        // Newest first
        finished.sort_by(|a, b| b.1.cmp(&a.1));

        let run_cutoff = now - chrono_duration(retention.run_ttl);
        let mut report = EvictionReport::default();
        for (rank, (id, finished_at)) in finished.into_iter().enumerate() {
            if rank >= retention.max_retained_runs || finished_at <= run_cutoff {
                runs.remove(&id);
                report.runs.push(id);
            }
        }

        let referenced: HashSet<Uuid> = runs.values().map(|h| h.pipeline_id).collect();
        let pipeline_cutoff = now - chrono_duration(retention.pipeline_ttl);
        pipelines.retain(|id, entry| {
            let keep = referenced.contains(id) || entry.last_used > pipeline_cutoff;
            if !keep {
                report.pipelines.push(*id);
            }
            keep
        });
        drop(runs);
        drop(pipelines);

        if !report.is_empty() {
            info!(
                runs = report.runs.len(),
                pipelines = report.pipelines.len(),
                "Evicted expired records"
            );
            self.event_bus.emit_lossy(ServiceEvent::RunsEvicted {
                runs: report.runs.len(),
                pipelines: report.pipelines.len(),
                timestamp: Utc::now(),
            });
        }
        report
    }

    /// Background eviction every `interval` until `shutdown` fires
    pub fn spawn_eviction_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Eviction sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.evict_expired(Utc::now()).await;
                        if report.is_empty() {
                            debug!("Eviction sweep found nothing to remove");
                        }
                    }
                }
            }
        })
    }

    /// Ask every in-flight run to stop (used on shutdown)
    pub async fn cancel_all(&self) {
        let runs = self.runs.read().await;
        let mut cancelled = 0;
        for handle in runs.values() {
            if !handle.status().await.is_terminal() {
                handle.request_cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(runs = cancelled, "Cancelling in-flight runs");
        }
    }
}
