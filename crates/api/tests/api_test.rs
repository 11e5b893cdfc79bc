use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use dispatch_api::{create_app, AppState};
use dispatch_core::config::AppConfig;
use dispatch_core::StaticFeatureFlags;
use dispatch_dispatcher::DispatchEngineBuilder;
use dispatch_infrastructure::{InMemoryBroadcastBus, InMemoryReleaseEntityRegistry, Repositories};
use serde_json::{json, Value};
use tower::ServiceExt;

const TENANT: &str = "tenant-1";

fn test_app() -> Router {
    let mut config = AppConfig::default();
    config.dispatcher.broadcast_jitter_factor = 0.0;
    let registry = InMemoryReleaseEntityRegistry::new();
    let engine = DispatchEngineBuilder::new(
        config.clone(),
        Repositories::in_memory(),
        Arc::new(InMemoryBroadcastBus::new(16)),
        Arc::new(StaticFeatureFlags::new()),
        Arc::new(registry.clone()),
    )
    .build();

    let state = AppState {
        engine,
        release_entities: registry,
        metrics: None,
        default_timeout_ms: config.dispatcher.default_sync_timeout_ms,
    };
    create_app(state, &config.api, &config.observability)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
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

fn shell_task_body() -> Value {
    json!({
        "tenant_id": TENANT,
        "queue": "default",
        "task_type": "shell",
        "parameters": {"command": "echo hi"},
        "timeout_ms": 60000
    })
}

async fn register_worker(app: &Router, prefix: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/api/workers/heartbeat",
        Some(json!({
            "tenant_id": TENANT,
            "hostname_prefix": prefix,
            "token": uuid::Uuid::new_v4().to_string(),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_metrics_disabled_without_exporter() {
    let app = test_app();
    let (status, _) = send(&app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_submit_returns_accepted_and_task_is_queued() {
    let app = test_app();
    let (status, body) = send(&app, "POST", "/api/tasks", Some(shell_task_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/api/tasks/{task_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "QUEUED");
    assert_eq!(body["data"]["broadcast_count"], 1);
}

#[tokio::test]
async fn test_invalid_submission_is_rejected_with_code() {
    let app = test_app();
    let mut task = shell_task_body();
    task["timeout_ms"] = json!(0);

    let (status, body) = send(&app, "POST", "/api/tasks", Some(task)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_out_of_range_timeout_is_rejected() {
    let app = test_app();
    for path in ["/api/tasks", "/api/tasks/execute"] {
        let mut task = shell_task_body();
        task["timeout_ms"] = json!(i64::MAX);

        let (status, body) = send(&app, "POST", path, Some(task)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR", "{path}");
    }
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let app = test_app();
    let (status, body) = send(&app, "GET", "/api/tasks/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "TASK_NOT_FOUND");
}

#[tokio::test]
async fn test_heartbeat_without_identity_is_invalid_token() {
    let app = test_app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/workers/heartbeat",
        Some(json!({"tenant_id": TENANT, "hostname_prefix": "ecs", "token": "null"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn test_keep_alive_with_wrong_token() {
    let app = test_app();
    register_worker(&app, "ecs").await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/workers/keep-alive",
        Some(json!({
            "tenant_id": TENANT,
            "hostname_prefix": "ecs",
            "sequence_number": 0,
            "token": "not-mine",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn test_acquire_and_respond_round_trip() {
    let app = test_app();
    let worker_id = register_worker(&app, "ecs").await;

    let (_, body) = send(&app, "POST", "/api/tasks", Some(shell_task_body())).await;
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

    let acquire = json!({"tenant_id": TENANT, "worker_id": worker_id, "queue": "default"});
    let (status, body) = send(&app, "POST", "/api/tasks/acquire", Some(acquire.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["task"]["id"], task_id.as_str());
    assert_eq!(body["data"]["validation_required"], false);

    // 已分配的任务不会再被领取
    let (status, _) = send(&app, "POST", "/api/tasks/acquire", Some(acquire)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let result = json!({
        "tenant_id": TENANT,
        "worker_id": worker_id,
        "response_code": "OK",
        "response": {"exit_code": 0},
    });
    let uri = format!("/api/tasks/{task_id}/response");
    let (status, body) = send(&app, "POST", &uri, Some(result.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["accepted"], true);

    let (_, body) = send(&app, "POST", &uri, Some(result)).await;
    assert_eq!(body["data"]["accepted"], false);

    let (_, body) = send(&app, "GET", &format!("/api/tasks/{task_id}"), None).await;
    assert_eq!(body["data"]["status"], "FINISHED");

    let (status, body) = send(
        &app,
        "GET",
        &format!("/api/tasks/{task_id}/selection-logs"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_abort_queued_task() {
    let app = test_app();
    let (_, body) = send(&app, "POST", "/api/tasks", Some(shell_task_body())).await;
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

    let uri = format!("/api/tasks/{task_id}/abort");
    let (status, body) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["aborted"], true);

    let (_, body) = send(&app, "POST", &uri, None).await;
    assert_eq!(body["data"]["aborted"], false);
}

#[tokio::test]
async fn test_constraint_admission_flow() {
    let app = test_app();
    let ensure = json!({"tenant_id": TENANT, "name": "env-prod"});
    let (status, body) = send(&app, "POST", "/api/constraints", Some(ensure.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let constraint_id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["capacity"], 1);

    let (_, body) = send(&app, "POST", "/api/constraints", Some(ensure)).await;
    assert_eq!(body["data"]["id"], constraint_id.as_str());

    let acquire_uri = format!("/api/constraints/{constraint_id}/acquire");
    let (_, first) = send(
        &app,
        "POST",
        &acquire_uri,
        Some(json!({
            "resource_unit": "infra-1",
            "release_entity": {"id": "exec-1", "entity_type": "WORKFLOW"},
        })),
    )
    .await;
    assert_eq!(first["data"]["state"], "ACTIVE");

    let (_, second) = send(
        &app,
        "POST",
        &acquire_uri,
        Some(json!({
            "resource_unit": "infra-1",
            "release_entity": {"id": "exec-2", "entity_type": "WORKFLOW"},
        })),
    )
    .await;
    assert_eq!(second["data"]["state"], "BLOCKED");

    // 容量不能低于当前占用
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/constraints/{constraint_id}/capacity"),
        Some(json!({"capacity": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/constraints/{constraint_id}/release"),
        Some(json!({"resource_unit": "infra-1", "release_entity_id": "exec-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let promoted = body["data"].as_array().unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0]["release_entity"]["id"], "exec-2");

    let (_, body) = send(
        &app,
        "GET",
        &format!("/api/constraints/{constraint_id}/units/infra-1/instances"),
        None,
    )
    .await;
    let instances = body["data"].as_array().unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0]["state"], "ACTIVE");
}

#[tokio::test]
async fn test_unknown_constraint_is_not_found() {
    let app = test_app();
    let (status, body) = send(&app, "GET", "/api/constraints/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "CONSTRAINT_NOT_FOUND");
}
