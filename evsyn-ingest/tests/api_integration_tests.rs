//! Integration tests for evsyn-ingest API endpoints

mod helpers;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use evsyn_ingest::inference::InferenceClient;
use evsyn_ingest::workflow::PipelineRegistry;
use evsyn_ingest::{build_router, AppState};
use helpers::{registry_with, test_settings, ScriptedInferenceClient};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower::util::ServiceExt;
use uuid::Uuid;

/// Test helper: router over a fresh registry
fn create_test_app(client: Arc<dyn InferenceClient>) -> (axum::Router, Arc<PipelineRegistry>) {
    let registry = Arc::new(registry_with(client, test_settings()));
    let app = build_router(AppState::new(registry.clone()));
    (app, registry)
}

fn default_app() -> (axum::Router, Arc<PipelineRegistry>) {
    create_test_app(Arc::new(ScriptedInferenceClient::new()))
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn create_pipeline(app: &axum::Router) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/pipelines",
        Some(json!({"project_id": "project-api", "features": {"auto_fix": true}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["pipeline_id"].as_str().unwrap().to_string()
}

fn run_request() -> Value {
    json!({
        "format": "csv",
        "text": "id,Title,Year,SMD,SE,N\n\
                 a,Exercise therapy for major depression,2020,0.42,0.12,100\n\
                 b,Mindfulness training in primary care,2021,not reported,0.10,80\n",
    })
}

/// TC-API-001: Health endpoint reports module and inference client
#[tokio::test]
async fn tc_api_001_health_endpoint() {
    let (app, _registry) = default_app();

    let (status, body) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "evsyn-ingest");
    assert_eq!(body["inference"], "scripted");
}

/// TC-API-002: Pipeline create, fetch, list, delete
#[tokio::test]
async fn tc_api_002_pipeline_lifecycle() {
    // Given: a created pipeline
    let (app, _registry) = default_app();
    let id = create_pipeline(&app).await;

    // When / Then: it can be fetched and listed
    let (status, body) = send(&app, "GET", &format!("/pipelines/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["project_id"], "project-api");
    assert_eq!(body["features"]["auto_fix"], true);
    assert_eq!(body["features"]["duplicate_detection"], true);
    assert_eq!(body["model_id"], "test-model");

    let (status, body) = send(&app, "GET", "/pipelines", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    // When / Then: deletion removes it
    let (status, _) = send(&app, "DELETE", &format!("/pipelines/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, "GET", &format!("/pipelines/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

/// TC-API-003: Invalid pipeline configuration is a bad request
#[tokio::test]
async fn tc_api_003_invalid_pipeline_config() {
    let (app, _registry) = default_app();

    let (status, body) = send(&app, "POST", "/pipelines", Some(json!({"project_id": ""}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

/// TC-API-004: Start a run, then read status and result
#[tokio::test]
async fn tc_api_004_start_run_and_fetch_result() {
    // Given: a pipeline
    let (app, registry) = default_app();
    let id = create_pipeline(&app).await;

    // When: a delimited batch is submitted
    let (status, body) = send(
        &app,
        "POST",
        &format!("/pipelines/{}/runs", id),
        Some(run_request()),
    )
    .await;

    // Then: the run is accepted
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = body["run_id"].as_str().unwrap().to_string();
    registry
        .await_result(Uuid::parse_str(&run_id).unwrap())
        .await
        .unwrap();

    // And: status and result describe the partial success
    let (status, body) = send(&app, "GET", &format!("/runs/{}", run_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "partial_success");
    assert_eq!(body["percent"], 100);
    assert_eq!(body["counts"]["processed"], 1);
    assert_eq!(body["counts"]["failed"], 1);

    let (status, body) = send(&app, "GET", &format!("/runs/{}/result", run_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["studies"].as_array().unwrap().len(), 2);
    assert_eq!(body["failures"][0]["study_id"], "b");
    assert!(!body["failures"][0]["issues"].as_array().unwrap().is_empty());

    // And: the run is listed under its pipeline
    let (status, body) = send(&app, "GET", &format!("/pipelines/{}/runs", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["run_id"], run_id.as_str());
}

/// TC-API-005: Result is a conflict while the run is in flight
#[tokio::test]
async fn tc_api_005_result_conflict_while_running() {
    // Given: a run blocked in its first stage
    let (client, gate): (ScriptedInferenceClient, Arc<Semaphore>) = ScriptedInferenceClient::gated();
    let (app, registry) = create_test_app(Arc::new(client));
    let id = create_pipeline(&app).await;
    let (_, body) = send(
        &app,
        "POST",
        &format!("/pipelines/{}/runs", id),
        Some(run_request()),
    )
    .await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    // When / Then: the result is refused with 409
    let (status, body) = send(&app, "GET", &format!("/runs/{}/result", run_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");

    // And: cancel is accepted while the run is in flight
    let (status, body) = send(&app, "POST", &format!("/runs/{}/cancel", run_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancel_requested"], true);

    gate.add_permits(1_000);
    let result = registry
        .await_result(Uuid::parse_str(&run_id).unwrap())
        .await
        .unwrap();
    assert_eq!(result.status.as_str(), "cancelled");

    // And: a second cancel reports the terminal status unchanged
    let (status, body) = send(&app, "POST", &format!("/runs/{}/cancel", run_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["cancel_requested"], false);
}

/// TC-API-006: Malformed run requests are rejected
#[tokio::test]
async fn tc_api_006_bad_run_requests() {
    let (app, _registry) = default_app();
    let id = create_pipeline(&app).await;
    let uri = format!("/pipelines/{}/runs", id);

    let (status, _) = send(&app, "POST", &uri, Some(json!({"format": "sav", "text": "a\n1"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", &uri, Some(json!({"format": "csv"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        &uri,
        Some(json!({"format": "json", "records": [], "text": "a\n1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", &uri, Some(json!({"format": "json", "records": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown pipeline is a configuration error, not a missing resource
    let (status, _) = send(
        &app,
        "POST",
        &format!("/pipelines/{}/runs", Uuid::new_v4()),
        Some(run_request()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// TC-API-007: Unknown runs are 404 on every endpoint
#[tokio::test]
async fn tc_api_007_unknown_run_not_found() {
    let (app, _registry) = default_app();
    let missing = Uuid::new_v4();

    for (method, uri) in [
        ("GET", format!("/runs/{}", missing)),
        ("GET", format!("/runs/{}/result", missing)),
        ("POST", format!("/runs/{}/cancel", missing)),
        ("GET", format!("/runs/{}/events", missing)),
    ] {
        let (status, _) = send(&app, method, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
    }
}

/// TC-API-008: Finished run replays its progress over SSE and ends
#[tokio::test]
async fn tc_api_008_run_events_replay() {
    // Given: a finished run
    let (app, registry) = default_app();
    let id = create_pipeline(&app).await;
    let (_, body) = send(
        &app,
        "POST",
        &format!("/pipelines/{}/runs", id),
        Some(run_request()),
    )
    .await;
    let run_id = body["run_id"].as_str().unwrap().to_string();
    registry
        .await_result(Uuid::parse_str(&run_id).unwrap())
        .await
        .unwrap();

    // When: a client opens the event stream
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/runs/{}/events", run_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Then: the whole history arrives as SSE and the stream closes
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("StageStarted"));
    assert!(text.contains("StudyCompleted"));
    assert!(text.contains("RunFinished"));
    assert!(text.contains("\"status\":\"partial_success\""));
}

/// TC-API-009: Browser clients on other origins are allowed
#[tokio::test]
async fn tc_api_009_cors_headers_present() {
    let (app, _registry) = default_app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header(header::ORIGIN, "http://localhost:5173")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
}
