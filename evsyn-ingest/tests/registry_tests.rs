//! Registry tests: lifecycle, cancellation, idempotency and retention

mod helpers;

use chrono::{Duration as ChronoDuration, Utc};
use evsyn_common::events::ServiceEvent;
use evsyn_ingest::inference::TaskType;
use evsyn_ingest::models::{InputFormat, PipelineConfig, RunStatus, Severity, StudyOutcome};
use evsyn_ingest::workflow::RawBatch;
use evsyn_ingest::PipelineError;
use helpers::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// TC-REG-001: Cancelling a finished run changes nothing
#[tokio::test]
async fn tc_reg_001_cancel_terminal_run_is_noop() {
    // Given: a run that already succeeded
    let registry = registry_with(Arc::new(ScriptedInferenceClient::new()), test_settings());
    let (run_id, before) = run_to_completion(&registry, all_features(), clean_batch()).await;

    // When: cancel is requested
    let status = registry.cancel(run_id).await.unwrap();

    // Then: the reported status and the result are unchanged
    assert_eq!(status, RunStatus::Succeeded);
    let after = registry.get_result(run_id).await.unwrap();
    assert_eq!(before, after);
}

/// TC-REG-002: Cancellation is observed at the next stage boundary
#[tokio::test]
async fn tc_reg_002_cancel_mid_run_stops_at_boundary() {
    // Given: a run blocked inside format detection
    let (client, gate) = ScriptedInferenceClient::gated();
    let client = Arc::new(client);
    let registry = registry_with(client.clone(), test_settings());
    let pipeline = registry
        .create_pipeline(pipeline_config(all_features()))
        .await
        .unwrap();
    let run_id = registry
        .start_run(pipeline.pipeline_id, InputFormat::Csv, clean_batch(), None)
        .await
        .unwrap();
    let probe = client.clone();
    wait_until(move || probe.calls_for(TaskType::FormatDetect).len() == 3).await;

    // When: cancel is requested, then the blocked calls are released
    let status = registry.cancel(run_id).await.unwrap();
    assert_eq!(status, RunStatus::Running);
    gate.add_permits(1_000);
    let result = registry.await_result(run_id).await.unwrap();

    // Then: the in-flight stage drained and nothing further ran
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.counts.cancelled, 3);
    assert!(client.calls_for(TaskType::FieldMap).is_empty());
    for report in &result.studies {
        assert_eq!(report.outcome, StudyOutcome::Cancelled);
        assert!(report
            .issues
            .iter()
            .any(|i| i.severity == Severity::Info && i.message.contains("parse")));
    }
}

/// TC-REG-003: Result is not available before the run ends
#[tokio::test]
async fn tc_reg_003_result_not_ready_while_running() {
    // Given: a run blocked inside its first stage
    let (client, gate) = ScriptedInferenceClient::gated();
    let client = Arc::new(client);
    let registry = registry_with(client.clone(), test_settings());
    let pipeline = registry
        .create_pipeline(pipeline_config(all_features()))
        .await
        .unwrap();
    let run_id = registry
        .start_run(pipeline.pipeline_id, InputFormat::Csv, clean_batch(), None)
        .await
        .unwrap();
    let probe = client.clone();
    wait_until(move || probe.total_calls() > 0).await;

    // When / Then: the result is refused as not ready
    let err = registry.get_result(run_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotReady(id) if id == run_id));

    // And: it becomes available once the run finishes
    gate.add_permits(1_000);
    let result = registry.await_result(run_id).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
}

/// TC-REG-004: Repeating a start with the same key returns the same run
#[tokio::test]
async fn tc_reg_004_idempotent_start() {
    // Given: a pipeline
    let registry = registry_with(Arc::new(ScriptedInferenceClient::new()), test_settings());
    let pipeline = registry
        .create_pipeline(pipeline_config(all_features()))
        .await
        .unwrap();
    let id = pipeline.pipeline_id;

    // When: the same batch is started twice with one key, once with another
    let first = registry
        .start_run(id, InputFormat::Csv, clean_batch(), Some("upload-42".into()))
        .await
        .unwrap();
    let repeat = registry
        .start_run(id, InputFormat::Csv, clean_batch(), Some(" upload-42 ".into()))
        .await
        .unwrap();
    let other = registry
        .start_run(id, InputFormat::Csv, clean_batch(), Some("upload-43".into()))
        .await
        .unwrap();

    // Then: the repeat maps to the first run, the new key to a new run
    assert_eq!(first, repeat);
    assert_ne!(first, other);
    assert_eq!(registry.list_runs(id).await.unwrap().len(), 2);

    registry.await_result(first).await.unwrap();
    registry.await_result(other).await.unwrap();
}

/// TC-REG-005: Unknown identifiers are reported as not found
#[tokio::test]
async fn tc_reg_005_unknown_ids() {
    let registry = registry_with(Arc::new(ScriptedInferenceClient::new()), test_settings());
    let missing = Uuid::new_v4();

    assert!(matches!(
        registry.get_status(missing).await,
        Err(PipelineError::RunNotFound(_))
    ));
    assert!(matches!(
        registry.get_result(missing).await,
        Err(PipelineError::RunNotFound(_))
    ));
    assert!(matches!(
        registry.cancel(missing).await,
        Err(PipelineError::RunNotFound(_))
    ));
    assert!(registry.subscribe(missing).await.is_err());
    assert!(matches!(
        registry.get_pipeline(missing).await,
        Err(PipelineError::PipelineNotFound(_))
    ));
    assert!(matches!(
        registry.list_runs(missing).await,
        Err(PipelineError::PipelineNotFound(_))
    ));
}

/// TC-REG-006: Starting against an unknown pipeline or with no records is rejected
#[tokio::test]
async fn tc_reg_006_invalid_starts_rejected() {
    // Given: one real pipeline
    let client = Arc::new(ScriptedInferenceClient::new());
    let registry = registry_with(client.clone(), test_settings());
    let pipeline = registry
        .create_pipeline(pipeline_config(all_features()))
        .await
        .unwrap();

    // When / Then: unknown pipeline
    let err = registry
        .start_run(Uuid::new_v4(), InputFormat::Csv, clean_batch(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfiguration(_)));

    // When / Then: empty batches in both shapes
    for batch in [
        RawBatch::Records(vec![]),
        RawBatch::Text("Title,SMD\n".to_string()),
    ] {
        let err = registry
            .start_run(pipeline.pipeline_id, InputFormat::Csv, batch, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
    }

    // And: no run was created and no call was made
    assert!(registry
        .list_runs(pipeline.pipeline_id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(client.total_calls(), 0);
}

/// TC-REG-007: Pipeline configuration is validated and defaulted
#[tokio::test]
async fn tc_reg_007_create_pipeline_validation() {
    let registry = registry_with(Arc::new(ScriptedInferenceClient::new()), test_settings());

    let err = registry
        .create_pipeline(PipelineConfig {
            project_id: "   ".to_string(),
            features: all_features(),
            model_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfiguration(_)));

    let defaulted = registry
        .create_pipeline(pipeline_config(all_features()))
        .await
        .unwrap();
    assert_eq!(defaulted.model_id, "test-model");

    let explicit = registry
        .create_pipeline(PipelineConfig {
            project_id: "project-2".to_string(),
            features: no_optional_features(),
            model_id: Some("meta-v2".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(explicit.model_id, "meta-v2");

    let listed = registry.list_pipelines().await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].pipeline_id, defaulted.pipeline_id);
}

/// TC-REG-008: Deleting a pipeline cancels its in-flight runs
#[tokio::test]
async fn tc_reg_008_delete_pipeline_cancels_runs() {
    // Given: a run blocked in its first stage
    let (client, gate) = ScriptedInferenceClient::gated();
    let client = Arc::new(client);
    let registry = registry_with(client.clone(), test_settings());
    let pipeline = registry
        .create_pipeline(pipeline_config(all_features()))
        .await
        .unwrap();
    let run_id = registry
        .start_run(pipeline.pipeline_id, InputFormat::Csv, clean_batch(), None)
        .await
        .unwrap();
    let probe = client.clone();
    wait_until(move || probe.total_calls() > 0).await;

    // When: the pipeline is deleted
    registry.delete_pipeline(pipeline.pipeline_id).await.unwrap();
    gate.add_permits(1_000);

    // Then: the run ends cancelled and stays readable
    let result = registry.await_result(run_id).await.unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(matches!(
        registry.get_pipeline(pipeline.pipeline_id).await,
        Err(PipelineError::PipelineNotFound(_))
    ));
    assert!(matches!(
        registry.delete_pipeline(pipeline.pipeline_id).await,
        Err(PipelineError::PipelineNotFound(_))
    ));
}

/// TC-REG-009: Retention evicts by count, by age and idle pipelines last
#[tokio::test]
async fn tc_reg_009_eviction_policy() {
    // Given: retention of a single completed run
    let mut settings = test_settings();
    settings.retention.max_retained_runs = 1;
    settings.retention.run_ttl = Duration::from_secs(3_600);
    settings.retention.pipeline_ttl = Duration::from_secs(86_400);
    let registry = registry_with(Arc::new(ScriptedInferenceClient::new()), settings);
    let pipeline = registry
        .create_pipeline(pipeline_config(all_features()))
        .await
        .unwrap();
    let id = pipeline.pipeline_id;

    let older = registry
        .start_run(id, InputFormat::Csv, clean_batch(), None)
        .await
        .unwrap();
    registry.await_result(older).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let newer = registry
        .start_run(id, InputFormat::Csv, clean_batch(), None)
        .await
        .unwrap();
    registry.await_result(newer).await.unwrap();

    // When: a sweep runs now
    let report = registry.evict_expired(Utc::now()).await;

    // Then: only the older completed run is gone
    assert_eq!(report.runs, vec![older]);
    assert!(report.pipelines.is_empty());
    assert!(matches!(
        registry.get_status(older).await,
        Err(PipelineError::RunNotFound(_))
    ));
    assert!(registry.get_result(newer).await.is_ok());

    // When: two hours pass
    let report = registry
        .evict_expired(Utc::now() + ChronoDuration::hours(2))
        .await;

    // Then: the remaining run expired, the pipeline is still recent
    assert_eq!(report.runs, vec![newer]);
    assert!(report.pipelines.is_empty());
    assert!(registry.get_pipeline(id).await.is_ok());

    // When: two days pass
    let report = registry
        .evict_expired(Utc::now() + ChronoDuration::days(2))
        .await;

    // Then: the idle pipeline is evicted too
    assert_eq!(report.pipelines, vec![id]);
    assert!(registry.get_pipeline(id).await.is_err());
}

/// TC-REG-010: In-flight runs and their pipelines are never evicted
#[tokio::test]
async fn tc_reg_010_in_flight_runs_survive_eviction() {
    // Given: a run blocked in its first stage
    let (client, gate) = ScriptedInferenceClient::gated();
    let client = Arc::new(client);
    let registry = registry_with(client.clone(), test_settings());
    let pipeline = registry
        .create_pipeline(pipeline_config(all_features()))
        .await
        .unwrap();
    let run_id = registry
        .start_run(pipeline.pipeline_id, InputFormat::Csv, clean_batch(), None)
        .await
        .unwrap();
    let probe = client.clone();
    wait_until(move || probe.total_calls() > 0).await;

    // When: a sweep runs far in the future
    let report = registry
        .evict_expired(Utc::now() + ChronoDuration::days(30))
        .await;

    // Then: nothing is removed
    assert!(report.is_empty());
    gate.add_permits(1_000);
    let result = registry.await_result(run_id).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
}

/// TC-REG-011: Concurrent runs of one pipeline do not interfere
#[tokio::test]
async fn tc_reg_011_concurrent_runs_independent() {
    // Given: one pipeline and two different batches
    let registry = registry_with(Arc::new(ScriptedInferenceClient::new()), test_settings());
    let pipeline = registry
        .create_pipeline(pipeline_config(all_features()))
        .await
        .unwrap();
    let broken = RawBatch::Records(vec![clean_record("x1", "Broken", "??")]);

    // When: both start before either finishes
    let good = registry
        .start_run(pipeline.pipeline_id, InputFormat::Csv, clean_batch(), None)
        .await
        .unwrap();
    let bad = registry
        .start_run(pipeline.pipeline_id, InputFormat::Csv, broken, None)
        .await
        .unwrap();
    let (good, bad) = tokio::join!(registry.await_result(good), registry.await_result(bad));

    // Then: each result reflects only its own batch
    let good = good.unwrap();
    let bad = bad.unwrap();
    assert_eq!(good.status, RunStatus::Succeeded);
    assert_eq!(good.studies.len(), 3);
    assert_eq!(bad.status, RunStatus::Failed);
    assert_eq!(bad.studies.len(), 1);
    assert!(bad.error.is_none());
}

/// TC-REG-012: Lifecycle notifications reach the service event bus
#[tokio::test]
async fn tc_reg_012_service_events_emitted() {
    // Given: a subscriber on the service bus
    let registry = registry_with(Arc::new(ScriptedInferenceClient::new()), test_settings());
    let mut events = registry.event_bus().subscribe();

    // When: a pipeline is created and a run completes
    let (run_id, _) = run_to_completion(&registry, all_features(), clean_batch()).await;

    // Then: creation, start and finish are announced in order
    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let ServiceEvent::RunFinished {
            run_id: finished,
            status,
            counts,
            ..
        } = &event
        {
            assert_eq!(*finished, run_id);
            assert_eq!(status, "succeeded");
            assert_eq!(counts.processed, 3);
        }
        kinds.push(event.event_type());
    }
    assert_eq!(kinds, vec!["PipelineCreated", "RunStarted", "RunFinished"]);
}
