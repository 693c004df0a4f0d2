//! Test Helper Utilities
//!
//! Shared utilities for testing evsyn-ingest

#![allow(dead_code)]

use async_trait::async_trait;
use evsyn_common::events::EventBus;
use evsyn_ingest::inference::{
    FailureKind, HeuristicInferenceClient, InferenceClient, InferenceFailure, TaskType,
};
use evsyn_ingest::models::{FeatureSet, InputFormat, PipelineConfig, RunResult, StudyReport};
use evsyn_ingest::workflow::{PipelineRegistry, RawBatch, RegistrySettings};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Scripted answer for one (task, study) pair
#[derive(Debug, Clone)]
pub enum Reply {
    Value(Value),
    Fail(FailureKind),
    /// Sleep, then answer heuristically
    Delay(Duration),
}

/// Deterministic inference fake
///
/// Unscripted calls fall through to the heuristic client. With a gate, every
/// call waits for a permit the test releases via `Semaphore::add_permits`.
pub struct ScriptedInferenceClient {
    fallback: HeuristicInferenceClient,
    replies: Mutex<HashMap<(TaskType, String), Reply>>,
    task_failures: Mutex<HashMap<TaskType, FailureKind>>,
    calls: Mutex<Vec<(TaskType, String)>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedInferenceClient {
    pub fn new() -> Self {
        Self {
            fallback: HeuristicInferenceClient::new(),
            replies: Mutex::new(HashMap::new()),
            task_failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Client whose calls block until the returned semaphore gets permits
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut client = Self::new();
        client.gate = Some(gate.clone());
        (client, gate)
    }

    pub fn reply(self, task: TaskType, study_id: &str, value: Value) -> Self {
        self.script(task, study_id, Reply::Value(value))
    }

    pub fn fail(self, task: TaskType, study_id: &str, kind: FailureKind) -> Self {
        self.script(task, study_id, Reply::Fail(kind))
    }

    pub fn delay(self, task: TaskType, study_id: &str, delay: Duration) -> Self {
        self.script(task, study_id, Reply::Delay(delay))
    }

    /// Every call for `task` fails with `kind`
    pub fn fail_task(self, task: TaskType, kind: FailureKind) -> Self {
        self.task_failures.lock().unwrap().insert(task, kind);
        self
    }

    fn script(self, task: TaskType, study_id: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert((task, study_id.to_string()), reply);
        self
    }

    /// Study ids called for `task`, in call order
    pub fn calls_for(&self, task: TaskType) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == task)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInferenceClient {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn infer(
        &self,
        task: TaskType,
        payload: Value,
        model_id: &str,
    ) -> Result<Value, InferenceFailure> {
        let study_id = payload
            .get("study_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.calls.lock().unwrap().push((task, study_id.clone()));

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }

        let task_failure = self.task_failures.lock().unwrap().get(&task).copied();
        if let Some(kind) = task_failure {
            return Err(InferenceFailure::new(kind, format!("scripted {:?}", kind)));
        }

        let reply = self.replies.lock().unwrap().get(&(task, study_id)).cloned();
        match reply {
            Some(Reply::Value(value)) => Ok(value),
            Some(Reply::Fail(kind)) => {
                Err(InferenceFailure::new(kind, format!("scripted {:?}", kind)))
            }
            Some(Reply::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                self.fallback.infer(task, payload, model_id).await
            }
            None => self.fallback.infer(task, payload, model_id).await,
        }
    }
}

/// Registry settings sized for tests
pub fn test_settings() -> RegistrySettings {
    let mut settings = RegistrySettings::default();
    settings.default_model = "test-model".to_string();
    settings.stage.call_timeout = Duration::from_secs(5);
    settings.subscriber_buffer = 64;
    settings
}

pub fn registry_with(client: Arc<dyn InferenceClient>, settings: RegistrySettings) -> PipelineRegistry {
    PipelineRegistry::new(client, settings, EventBus::new(100))
}

pub fn pipeline_config(features: FeatureSet) -> PipelineConfig {
    PipelineConfig {
        project_id: "project-1".to_string(),
        features,
        model_id: None,
    }
}

pub fn all_features() -> FeatureSet {
    FeatureSet::default()
}

pub fn no_optional_features() -> FeatureSet {
    FeatureSet {
        quality_assessment: false,
        duplicate_detection: false,
        auto_fix: false,
    }
}

/// Complete, clean study record
pub fn clean_record(id: &str, title: &str, effect_size: &str) -> Value {
    json!({
        "id": id,
        "Title": title,
        "Authors": "Smith J; Lee K",
        "Year": "2020",
        "SMD": effect_size,
        "SE": "0.12",
        "N": "100",
        "Outcome": "depression score",
    })
}

/// Three distinct, clean studies: s1, s2, s3
pub fn clean_batch() -> RawBatch {
    RawBatch::Records(vec![
        clean_record("s1", "Exercise therapy for major depression", "0.42"),
        clean_record("s2", "Mindfulness training in primary care", "0.18"),
        clean_record("s3", "Sleep hygiene education for adolescents", "-0.05"),
    ])
}

/// Create a pipeline, run a batch and wait for the result
pub async fn run_to_completion(
    registry: &PipelineRegistry,
    features: FeatureSet,
    batch: RawBatch,
) -> (Uuid, RunResult) {
    let pipeline = registry
        .create_pipeline(pipeline_config(features))
        .await
        .unwrap();
    let run_id = registry
        .start_run(pipeline.pipeline_id, InputFormat::Csv, batch, None)
        .await
        .unwrap();
    let result = registry.await_result(run_id).await.unwrap();
    (run_id, result)
}

pub fn study<'a>(result: &'a RunResult, study_id: &str) -> &'a StudyReport {
    result
        .studies
        .iter()
        .find(|s| s.study_id == study_id)
        .unwrap_or_else(|| panic!("study {} missing from result", study_id))
}

/// Poll until `condition` holds, failing after two seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
