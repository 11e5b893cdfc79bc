use std::sync::Arc;

use async_trait::async_trait;
use dispatch_api::{create_app, AppState};
use dispatch_core::config::{AppConfig, WorkerConfig};
use dispatch_core::models::{Task, TaskData, TaskStatus};
use dispatch_core::{DispatchError, DispatchResult, StaticFeatureFlags};
use dispatch_dispatcher::{DispatchEngine, DispatchEngineBuilder};
use dispatch_infrastructure::{InMemoryBroadcastBus, InMemoryReleaseEntityRegistry, Repositories};
use dispatch_worker::{
    DispatcherClient, ExecutionOutcome, ExecutorRegistry, PollOutcome, TaskExecutor, WorkerAgent,
};
use serde_json::json;
use tokio::net::TcpListener;

const TENANT: &str = "tenant-1";

/// 不启动外部进程的执行器
struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    fn task_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, task: &Task) -> DispatchResult<ExecutionOutcome> {
        Ok(ExecutionOutcome {
            success: true,
            output: Some(task.data.parameters.to_string()),
            error_message: None,
            exit_code: Some(0),
            execution_time_ms: 1,
        })
    }
}

struct Server {
    engine: DispatchEngine,
    url: String,
}

async fn start_server() -> Server {
    let config = AppConfig::default();
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
        engine: engine.clone(),
        release_entities: registry,
        metrics: None,
        default_timeout_ms: config.dispatcher.default_sync_timeout_ms,
    };
    let app = create_app(state, &config.api, &config.observability);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        engine,
        url: format!("http://{addr}"),
    }
}

fn worker_config(url: &str, identity_file: &std::path::Path) -> WorkerConfig {
    WorkerConfig {
        enabled: true,
        tenant_id: TENANT.to_string(),
        dispatcher_url: url.to_string(),
        hostname_prefix: "ecs-worker".to_string(),
        identity_file: identity_file.display().to_string(),
        ..WorkerConfig::default()
    }
}

fn echo_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(EchoExecutor));
    registry
}

fn task(task_type: &str) -> Task {
    Task::new(
        TENANT,
        "default",
        TaskData {
            task_type: task_type.to_string(),
            parameters: json!({"message": "hi"}),
            timeout_ms: 60_000,
            is_async: false,
        },
    )
}

#[tokio::test]
async fn test_agent_executes_acquired_task() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let agent = WorkerAgent::new(
        worker_config(&server.url, &dir.path().join("identity.json")),
        echo_registry(),
    )
    .await
    .unwrap();

    let worker = agent.heartbeat().await.unwrap();
    assert_eq!(worker.hostname, "ecs-worker_0");

    let task_id = server.engine.submission.submit(task("echo")).await.unwrap();
    let outcome = agent.poll_once().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Executed {
            task_id: task_id.clone(),
            success: true
        }
    );

    let stored = server.engine.submission.get(&task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Finished);
    assert_eq!(stored.worker_id.as_deref(), Some(worker.id.as_str()));

    assert_eq!(agent.poll_once().await.unwrap(), PollOutcome::Idle);
}

#[tokio::test]
async fn test_restarted_agent_keeps_sequence_identity() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let identity_file = dir.path().join("identity.json");

    let first = WorkerAgent::new(worker_config(&server.url, &identity_file), echo_registry())
        .await
        .unwrap();
    let registered = first.heartbeat().await.unwrap();
    drop(first);

    let restarted = WorkerAgent::new(worker_config(&server.url, &identity_file), echo_registry())
        .await
        .unwrap();
    assert_eq!(
        restarted.identity().await.worker_id.as_deref(),
        Some(registered.id.as_str())
    );
    let again = restarted.heartbeat().await.unwrap();
    assert_eq!(again.id, registered.id);
    assert_eq!(again.sequence_number, Some(0));
}

#[tokio::test]
async fn test_unsupported_task_is_declined() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let agent = WorkerAgent::new(
        worker_config(&server.url, &dir.path().join("identity.json")),
        echo_registry(),
    )
    .await
    .unwrap();
    let worker = agent.heartbeat().await.unwrap();

    let task_id = server.engine.submission.submit(task("python")).await.unwrap();
    assert_eq!(
        agent.poll_once().await.unwrap(),
        PollOutcome::Declined(task_id.clone())
    );

    let stored = server.engine.submission.get(&task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Queued);
    assert!(stored.has_tried(&worker.id));
}

#[tokio::test]
async fn test_poll_before_registration_fails() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let agent = WorkerAgent::new(
        worker_config(&server.url, &dir.path().join("identity.json")),
        echo_registry(),
    )
    .await
    .unwrap();

    assert!(agent.poll_once().await.is_err());
}

#[tokio::test]
async fn test_client_maps_invalid_token_error() {
    let server = start_server().await;
    let client = DispatcherClient::new(format!("{}/", server.url));
    let request = dispatch_core::models::HeartbeatRequest {
        tenant_id: TENANT.to_string(),
        hostname_prefix: "ecs".to_string(),
        ..Default::default()
    };

    let err = client.heartbeat(&request).await.unwrap_err();
    assert!(matches!(err, DispatchError::InvalidToken(_)));
}
