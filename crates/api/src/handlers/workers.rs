use axum::{
    extract::{Query, State},
    response::Response,
    Json,
};
use dispatch_core::models::HeartbeatRequest;
use dispatch_core::DispatchError;
use serde::Deserialize;

use crate::{error::ApiResult, response::success, routes::AppState};

#[derive(Debug, Deserialize)]
pub struct KeepAliveRequest {
    pub tenant_id: String,
    pub hostname_prefix: String,
    pub sequence_number: i32,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkerQueryParams {
    pub tenant_id: String,
}

/// Worker心跳/注册，返回解析后的身份
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Response> {
    let worker = state.engine.identity.reconcile(&request).await?;
    Ok(success(worker))
}

/// 刷新序号身份；令牌不匹配时返回INVALID_TOKEN
pub async fn keep_alive(
    State(state): State<AppState>,
    Json(request): Json<KeepAliveRequest>,
) -> ApiResult<Response> {
    let alive = state
        .engine
        .identity
        .keep_alive(
            &request.tenant_id,
            &request.hostname_prefix,
            request.sequence_number,
            &request.token,
        )
        .await?;
    if !alive {
        return Err(DispatchError::invalid_token(format!(
            "序号 {}_{} 的令牌不匹配",
            request.hostname_prefix, request.sequence_number
        ))
        .into());
    }
    Ok(success(serde_json::json!({ "alive": true })))
}

pub async fn list_connected_workers(
    State(state): State<AppState>,
    Query(params): Query<WorkerQueryParams>,
) -> ApiResult<Response> {
    let workers = state
        .engine
        .identity
        .connected_workers(&params.tenant_id)
        .await?;
    Ok(success(workers))
}
