use axum::{
    routing::{get, post},
    Router,
};
use dispatch_dispatcher::DispatchEngine;
use dispatch_infrastructure::InMemoryReleaseEntityRegistry;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::handlers::{
    constraints::{
        acquire_permits, ensure_constraint, get_constraint, list_instances,
        mark_release_entity_terminal, release_permits, update_capacity,
    },
    health::{health_check, metrics},
    tasks::{
        abort_task, acquire_task, decline_task, execute_task, get_selection_logs, get_task,
        report_validation, submit_result, submit_task,
    },
    workers::{heartbeat, keep_alive, list_connected_workers},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub engine: DispatchEngine,
    pub release_entities: InMemoryReleaseEntityRegistry,
    pub metrics: Option<PrometheusHandle>,
    /// 提交请求未指定超时时使用
    pub default_timeout_ms: i64,
}

impl AppState {
    pub fn default_timeout_ms(&self) -> i64 {
        self.default_timeout_ms
    }
}

/// 普通请求的路由，受统一请求超时约束
pub fn create_routes(metrics_endpoint: &str) -> Router<AppState> {
    Router::new()
        // 健康检查与指标
        .route("/health", get(health_check))
        .route(metrics_endpoint, get(metrics))
        // 任务提交与查询
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/abort", post(abort_task))
        .route("/api/tasks/{id}/selection-logs", get(get_selection_logs))
        // Worker侧接口
        .route("/api/tasks/acquire", post(acquire_task))
        .route("/api/tasks/{id}/validation", post(report_validation))
        .route("/api/tasks/{id}/decline", post(decline_task))
        .route("/api/tasks/{id}/response", post(submit_result))
        .route("/api/workers", get(list_connected_workers))
        .route("/api/workers/heartbeat", post(heartbeat))
        .route("/api/workers/keep-alive", post(keep_alive))
        // 容量准入
        .route("/api/constraints", post(ensure_constraint))
        .route("/api/constraints/{id}", get(get_constraint))
        .route("/api/constraints/{id}/capacity", post(update_capacity))
        .route("/api/constraints/{id}/acquire", post(acquire_permits))
        .route("/api/constraints/{id}/release", post(release_permits))
        .route(
            "/api/constraints/{id}/units/{unit}/instances",
            get(list_instances),
        )
        .route(
            "/api/release-entities/terminal",
            post(mark_release_entity_terminal),
        )
}

/// 同步执行会阻塞到任务自身的超时，不走统一请求超时
pub fn create_blocking_routes() -> Router<AppState> {
    Router::new().route("/api/tasks/execute", post(execute_task))
}
