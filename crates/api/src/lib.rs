//! # Dispatch API
//!
//! 任务分发与准入控制的HTTP接口，基于Axum构建。
//!
//! ## API 端点
//!
//! ### 任务
//! - `POST /api/tasks` - 提交任务，返回202和任务ID
//! - `POST /api/tasks/execute` - 同步执行，阻塞到结果返回或超时
//! - `GET /api/tasks/{id}` - 任务详情
//! - `POST /api/tasks/{id}/abort` - 取消排队中的任务
//! - `GET /api/tasks/{id}/selection-logs` - 选择审计记录
//!
//! ### Worker
//! - `POST /api/workers/heartbeat` - 心跳/注册，无法解析身份时返回 `INVALID_TOKEN`
//! - `POST /api/workers/keep-alive` - 刷新序号身份
//! - `GET /api/workers?tenant_id=` - 在线Worker
//! - `POST /api/tasks/acquire` - 拉取任务，没有任务时返回204
//! - `POST /api/tasks/{id}/validation` - 回报能力验证结果
//! - `POST /api/tasks/{id}/decline` - 拒绝任务
//! - `POST /api/tasks/{id}/response` - 回传执行结果
//!
//! ### 容量准入
//! - `POST /api/constraints` - 幂等创建约束
//! - `GET /api/constraints/{id}`
//! - `POST /api/constraints/{id}/capacity`
//! - `POST /api/constraints/{id}/acquire`
//! - `POST /api/constraints/{id}/release`
//! - `GET /api/constraints/{id}/units/{unit}/instances`
//! - `POST /api/release-entities/terminal`
//!
//! ## 错误响应
//!
//! ```json
//! {
//!   "success": false,
//!   "error": { "code": "VALIDATION_ERROR", "message": "..." },
//!   "timestamp": "2024-01-01T00:00:00Z"
//! }
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use dispatch_core::config::{ApiConfig, ObservabilityConfig};
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, timeout_layer, trace_layer};
pub use routes::AppState;
use routes::{create_blocking_routes, create_routes};

/// 创建完整的API应用
pub fn create_app(
    state: AppState,
    api_config: &ApiConfig,
    observability: &ObservabilityConfig,
) -> Router {
    let metrics_endpoint = if observability.metrics_enabled {
        observability.metrics_endpoint.as_str()
    } else {
        "/metrics"
    };

    let router = create_routes(metrics_endpoint)
        .layer(timeout_layer(api_config))
        .merge(create_blocking_routes());

    let router = if api_config.cors_enabled {
        router.layer(cors_layer(api_config))
    } else {
        router
    };

    router
        .layer(
            ServiceBuilder::new()
                .layer(trace_layer())
                .layer(axum::middleware::from_fn(request_logging)),
        )
        .with_state(state)
}
