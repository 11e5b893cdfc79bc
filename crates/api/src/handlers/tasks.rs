use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use dispatch_core::models::{CapabilityCheck, ResponseCode, Task, TaskData, TaskResponse};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    response::{accepted, no_content, success},
    routes::AppState,
};

/// 任务提交请求
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub tenant_id: String,
    pub queue: String,
    pub task_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub timeout_ms: Option<i64>,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    pub must_execute_on_worker_id: Option<String>,
    pub wait_id: Option<String>,
    pub driver_id: Option<String>,
}

impl SubmitTaskRequest {
    fn into_task(self, default_timeout_ms: i64) -> Task {
        let data = TaskData {
            task_type: self.task_type,
            parameters: self.parameters,
            timeout_ms: self.timeout_ms.unwrap_or(default_timeout_ms),
            is_async: self.is_async,
        };
        let mut task = Task::new(self.tenant_id, self.queue, data)
            .with_selectors(self.selectors)
            .with_capabilities(self.capabilities);
        task.setup_abstractions = self.setup_abstractions;
        task.must_execute_on_worker_id = self.must_execute_on_worker_id;
        task.wait_id = self.wait_id;
        task.driver_id = self.driver_id;
        task
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

/// Worker拉取请求
#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub tenant_id: String,
    pub worker_id: String,
    pub queue: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidationReportRequest {
    pub tenant_id: String,
    pub worker_id: String,
    #[serde(default)]
    pub results: Vec<CapabilityCheck>,
}

#[derive(Debug, Deserialize)]
pub struct DeclineRequest {
    pub tenant_id: String,
    pub worker_id: String,
}

/// Worker回传的执行结果
#[derive(Debug, Deserialize)]
pub struct TaskResultRequest {
    pub tenant_id: String,
    pub worker_id: String,
    pub response_code: ResponseCode,
    #[serde(default)]
    pub response: serde_json::Value,
    pub error_message: Option<String>,
}

/// 提交任务，立即返回任务ID
pub async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult<Response> {
    let task = request.into_task(state.default_timeout_ms());
    let task_id = state.engine.submission.submit(task).await?;
    Ok(accepted(SubmitTaskResponse { task_id }))
}

/// 同步执行，阻塞到Worker回传结果或超时
pub async fn execute_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult<Response> {
    let task = request.into_task(state.default_timeout_ms());
    let response = state.engine.submission.execute(task).await?;
    Ok(success(response))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let task = state.engine.submission.get(&id).await?;
    Ok(success(task))
}

pub async fn abort_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let aborted = state.engine.submission.abort(&id).await?;
    Ok(success(serde_json::json!({ "aborted": aborted })))
}

/// 任务的选择审计记录，按封存时间排列
pub async fn get_selection_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let task = state.engine.submission.get(&id).await?;
    let logs = state.engine.audit.history(&task.tenant_id, &task.id).await?;
    Ok(success(logs))
}

/// Worker拉取任务；没有可领取的任务时返回204
pub async fn acquire_task(
    State(state): State<AppState>,
    Json(request): Json<AcquireRequest>,
) -> ApiResult<Response> {
    if request.queue.trim().is_empty() {
        return Err(ApiError::bad_request("queue不能为空"));
    }
    let package = state
        .engine
        .acquisition
        .acquire(&request.tenant_id, &request.worker_id, &request.queue)
        .await?;
    Ok(match package {
        Some(package) => success(package),
        None => no_content(),
    })
}

pub async fn report_validation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ValidationReportRequest>,
) -> ApiResult<Response> {
    let package = state
        .engine
        .acquisition
        .report_validation(&request.tenant_id, &request.worker_id, &id, &request.results)
        .await?;
    Ok(match package {
        Some(package) => success(package),
        None => no_content(),
    })
}

pub async fn decline_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DeclineRequest>,
) -> ApiResult<Response> {
    let declined = state
        .engine
        .acquisition
        .decline(&request.tenant_id, &request.worker_id, &id)
        .await?;
    Ok(success(serde_json::json!({ "declined": declined })))
}

/// Worker提交执行结果，重复提交返回 `accepted=false`
pub async fn submit_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TaskResultRequest>,
) -> ApiResult<Response> {
    let response = TaskResponse {
        task_id: id.clone(),
        response_code: request.response_code,
        response: request.response,
        error_message: request.error_message,
        expired: false,
    };
    let accepted = state
        .engine
        .acquisition
        .submit_response(&request.tenant_id, &request.worker_id, response)
        .await?;
    if !accepted {
        info!("任务 {} 的结果未被接受（Worker {}）", id, request.worker_id);
    }
    Ok(success(serde_json::json!({ "accepted": accepted })))
}
