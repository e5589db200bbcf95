//! HTTP surface tests driven through the router.
//!
//! Covers the CRUD round-trip, pagination clamping, manual-advance guards,
//! launch semantics and the scrubbed status projection.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use discovery::config::{AppState, Config};
use discovery::handlers;
use discovery::store::MemStore;

fn test_state(worker_url: &str) -> AppState {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        worker_base_url: worker_url.to_string(),
        database_url: None,
    };
    AppState::new(config, Arc::new(MemStore::new()))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn script_step(server: &MockServer, name: &str, response: Value) {
    Mock::given(method("POST"))
        .and(path(format!("/steps/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .mount(server)
        .await;
}

fn three_step_workflow() -> Value {
    json!({
        "name": "filing-pipeline",
        "mode": "automatic",
        "steps": [
            {"name": "classify", "order": 1, "max_visits": 1},
            {"name": "reorder", "order": 2, "max_visits": 2},
            {"name": "annotate", "order": 3, "max_visits": 1},
        ],
    })
}

#[tokio::test]
async fn test_workflow_create_then_list_steps_roundtrip() {
    let server = MockServer::start().await;
    let app = handlers::app(test_state(&server.uri()));

    let (status, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    assert_eq!(status, StatusCode::OK);
    let wf_id = workflow["id"].as_str().unwrap().to_string();
    assert_eq!(workflow["name"], "filing-pipeline");
    assert_eq!(workflow["mode"], "automatic");

    let (status, steps) = send(&app, "GET", &format!("/workflows/{wf_id}/steps"), None).await;
    assert_eq!(status, StatusCode::OK);
    let steps = steps.as_array().unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0]["name"], "classify");
    assert_eq!(steps[1]["name"], "reorder");
    assert_eq!(steps[1]["max_visits"], 2);
    assert_eq!(steps[2]["order"], 3);
}

#[tokio::test]
async fn test_patch_workflow_empty_body_is_noop() {
    let server = MockServer::start().await;
    let app = handlers::app(test_state(&server.uri()));

    let (_, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    let wf_id = workflow["id"].as_str().unwrap().to_string();

    let (status, patched) =
        send(&app, "PATCH", &format!("/workflows/{wf_id}"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["name"], workflow["name"]);
    assert_eq!(patched["mode"], workflow["mode"]);
    assert_eq!(patched["id"], workflow["id"]);
}

#[tokio::test]
async fn test_workflow_name_must_not_be_empty() {
    let server = MockServer::start().await;
    let app = handlers::app(test_state(&server.uri()));

    let (status, body) = send(
        &app,
        "POST",
        "/workflows",
        Some(json!({"name": "  ", "steps": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("name"));
}

#[tokio::test]
async fn test_unknown_entities_return_404() {
    let server = MockServer::start().await;
    let app = handlers::app(test_state(&server.uri()));
    let missing = Uuid::new_v4();

    let (status, _) = send(&app, "GET", &format!("/workflows/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "GET", &format!("/steps/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "GET", &format!("/executions/{missing}/status"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "POST", &format!("/executions/{missing}/next"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pagination_clamps_limit_and_offset() {
    let server = MockServer::start().await;
    let app = handlers::app(test_state(&server.uri()));

    let (_, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    let wf_id = workflow["id"].as_str().unwrap().to_string();

    let (status, page) = send(
        &app,
        "GET",
        &format!("/workflows/{wf_id}/executions?limit=500&offset=-5"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["pagination"]["limit"], 100);
    assert_eq!(page["pagination"]["offset"], 0);
    assert_eq!(page["pagination"]["total"], 0);
    assert_eq!(page["pagination"]["has_more"], false);
}

#[tokio::test]
async fn test_sync_execute_runs_to_completion() {
    let server = MockServer::start().await;
    script_step(&server, "classify", json!({"context": {"kind": "ine"}})).await;
    script_step(&server, "reorder", json!({"context": {"reordered": true}})).await;
    script_step(&server, "annotate", json!({"context": {"annotated": true}})).await;

    let app = handlers::app(test_state(&server.uri()));
    let (_, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    let wf_id = workflow["id"].as_str().unwrap().to_string();

    let (status, execution) = send(
        &app,
        "POST",
        &format!("/workflows/{wf_id}/execute"),
        Some(json!({"uuid_proceso": "p-77"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["status"], "completed");
    assert_eq!(execution["context"]["kind"], "ine");
    assert_eq!(execution["context"]["annotated"], true);
    assert_eq!(execution["context"]["uuid_proceso"], "p-77");

    let exec_id = execution["id"].as_str().unwrap().to_string();
    let (status, attempts) = send(&app, "GET", &format!("/executions/{exec_id}/steps"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(attempts.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_sync_execute_returns_failed_execution_with_200() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/steps/classify"))
        .respond_with(ResponseTemplate::new(503).set_body_string("worker down"))
        .mount(&server)
        .await;

    let app = handlers::app(test_state(&server.uri()));
    let (_, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    let wf_id = workflow["id"].as_str().unwrap().to_string();

    let (status, execution) = send(
        &app,
        "POST",
        &format!("/workflows/{wf_id}/execute"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["status"], "failed");
}

#[tokio::test]
async fn test_async_execute_returns_tracking_endpoints() {
    let server = MockServer::start().await;
    script_step(&server, "classify", json!({"context": {}})).await;
    script_step(&server, "reorder", json!({"context": {}})).await;
    script_step(&server, "annotate", json!({"context": {}})).await;

    let app = handlers::app(test_state(&server.uri()));
    let (_, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    let wf_id = workflow["id"].as_str().unwrap().to_string();

    let (status, launch) = send(
        &app,
        "POST",
        &format!("/workflows/{wf_id}/execute-async"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let exec_id = launch["execution_id"].as_str().unwrap().to_string();
    assert_eq!(launch["status"], "running");
    assert_eq!(
        launch["tracking_url"],
        format!("/executions/{exec_id}/status")
    );
    assert_eq!(launch["websocket_url"], format!("/ws/{exec_id}"));
}

#[tokio::test]
async fn test_manual_flow_through_next_endpoint() {
    let server = MockServer::start().await;
    script_step(&server, "classify", json!({"context": {}})).await;
    script_step(&server, "reorder", json!({"context": {}})).await;
    script_step(&server, "annotate", json!({"context": {}})).await;

    let app = handlers::app(test_state(&server.uri()));
    let (_, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    let wf_id = workflow["id"].as_str().unwrap().to_string();

    let (status, execution) = send(
        &app,
        "POST",
        &format!("/workflows/{wf_id}/execute"),
        Some(json!({"mode": "manual"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["status"], "running");
    assert!(execution["current_step_id"].is_null());
    let exec_id = execution["id"].as_str().unwrap().to_string();

    let (status, after_first) =
        send(&app, "POST", &format!("/executions/{exec_id}/next"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after_first["status"], "running");
    assert!(!after_first["current_step_id"].is_null());

    let (status, _) = send(&app, "POST", &format!("/executions/{exec_id}/next"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, last) = send(&app, "POST", &format!("/executions/{exec_id}/next"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(last["status"], "completed");

    // A further advance on the completed execution is an invariant violation.
    let (status, error) = send(&app, "POST", &format!("/executions/{exec_id}/next"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(error["error"].as_str().unwrap().contains("completed"));
}

#[tokio::test]
async fn test_next_rejected_for_automatic_executions() {
    let server = MockServer::start().await;
    script_step(&server, "classify", json!({"context": {}})).await;
    script_step(&server, "reorder", json!({"context": {}})).await;
    script_step(&server, "annotate", json!({"context": {}})).await;

    let app = handlers::app(test_state(&server.uri()));
    let (_, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    let wf_id = workflow["id"].as_str().unwrap().to_string();

    let (_, launch) = send(
        &app,
        "POST",
        &format!("/workflows/{wf_id}/execute-async"),
        Some(json!({})),
    )
    .await;
    let exec_id = launch["execution_id"].as_str().unwrap().to_string();

    let (status, error) = send(&app, "POST", &format!("/executions/{exec_id}/next"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["error"].as_str().unwrap().contains("manual"));
}

#[tokio::test]
async fn test_delete_workflow_with_active_execution_conflicts() {
    let server = MockServer::start().await;
    let app = handlers::app(test_state(&server.uri()));

    let (_, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    let wf_id = workflow["id"].as_str().unwrap().to_string();

    // A manual launch stays running until advanced.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/workflows/{wf_id}/execute"),
        Some(json!({"mode": "manual"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, "DELETE", &format!("/workflows/{wf_id}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_status_endpoint_scrubs_base64_and_reports_progress() {
    let server = MockServer::start().await;
    script_step(&server, "classify", json!({"context": {}})).await;
    script_step(&server, "reorder", json!({"context": {}})).await;
    script_step(&server, "annotate", json!({"context": {}})).await;

    let app = handlers::app(test_state(&server.uri()));
    let (_, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    let wf_id = workflow["id"].as_str().unwrap().to_string();

    let payload = "a".repeat(4096);
    let (status, execution) = send(
        &app,
        "POST",
        &format!("/workflows/{wf_id}/execute"),
        Some(json!({"base64": payload})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let exec_id = execution["id"].as_str().unwrap().to_string();

    let (status, report) = send(&app, "GET", &format!("/executions/{exec_id}/status"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["status"], "completed");
    assert_eq!(
        report["context"]["base64"],
        "[BASE64_CONTENT_REMOVED - Length: 4096 chars]"
    );
    assert_eq!(report["progress"]["total_steps"], 3);
    assert_eq!(report["progress"]["completed_steps"], 3);
    assert_eq!(report["progress"]["percentage"], 100.0);
    assert_eq!(report["progress"]["is_completed"], true);
    assert_eq!(report["steps_history"].as_array().unwrap().len(), 1);
    assert_eq!(report["steps_history"][0]["step_name"], "annotate");

    // Persisted snapshots carry the same substitution.
    let (_, attempts) = send(&app, "GET", &format!("/executions/{exec_id}/steps"), None).await;
    for attempt in attempts.as_array().unwrap() {
        assert_eq!(
            attempt["input_payload"]["base64"],
            "[BASE64_CONTENT_REMOVED - Length: 4096 chars]"
        );
    }

    // Repeated reads of a settled execution are stable.
    let (_, second) = send(&app, "GET", &format!("/executions/{exec_id}/status"), None).await;
    assert_eq!(second["status"], report["status"]);
    assert_eq!(second["progress"], report["progress"]);
}

#[tokio::test]
async fn test_step_progress_and_completion_reports_are_acked() {
    let server = MockServer::start().await;
    script_step(&server, "classify", json!({"context": {}})).await;
    script_step(&server, "reorder", json!({"context": {}})).await;
    script_step(&server, "annotate", json!({"context": {}})).await;

    let app = handlers::app(test_state(&server.uri()));
    let (_, workflow) = send(&app, "POST", "/workflows", Some(three_step_workflow())).await;
    let wf_id = workflow["id"].as_str().unwrap().to_string();

    let (_, execution) = send(
        &app,
        "POST",
        &format!("/workflows/{wf_id}/execute"),
        Some(json!({"mode": "manual"})),
    )
    .await;
    let exec_id = execution["id"].as_str().unwrap().to_string();

    let (status, ack) = send(
        &app,
        "POST",
        &format!("/executions/{exec_id}/steps/classify/progress"),
        Some(json!({"percentage": 50, "message": "halfway"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "success");
    assert_eq!(ack["progress_recorded"]["percentage"], 50);

    let (status, ack) = send(
        &app,
        "POST",
        &format!("/executions/{exec_id}/steps/classify/complete"),
        Some(json!({"success": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["completion_recorded"]["success"], true);
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = MockServer::start().await;
    let app = handlers::app(test_state(&server.uri()));
    let (status, body) = send(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
