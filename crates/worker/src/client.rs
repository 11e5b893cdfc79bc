use std::time::Duration;

use dispatch_core::models::{
    CapabilityCheck, HeartbeatRequest, ResponseCode, TaskPackage, Worker,
};
use dispatch_core::{DispatchError, DispatchResult};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// 回传给Dispatcher的执行结果
#[derive(Debug, Clone, Serialize)]
pub struct TaskResultBody {
    pub response_code: ResponseCode,
    pub response: serde_json::Value,
    pub error_message: Option<String>,
}

/// Dispatcher HTTP客户端
#[derive(Clone)]
pub struct DispatcherClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl DispatcherClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 心跳/注册，返回服务端解析后的Worker记录
    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> DispatchResult<Worker> {
        let url = format!("{}/api/workers/heartbeat", self.base_url);
        let response = self.send(self.http_client.post(&url).json(request)).await?;
        self.expect_data(response).await
    }

    /// 拉取任务，没有任务时返回 `None`
    pub async fn acquire(
        &self,
        tenant_id: &str,
        worker_id: &str,
        queue: &str,
    ) -> DispatchResult<Option<TaskPackage>> {
        let url = format!("{}/api/tasks/acquire", self.base_url);
        let body = json!({
            "tenant_id": tenant_id,
            "worker_id": worker_id,
            "queue": queue,
        });
        let response = self.send(self.http_client.post(&url).json(&body)).await?;
        self.optional_data(response).await
    }

    pub async fn report_validation(
        &self,
        tenant_id: &str,
        worker_id: &str,
        task_id: &str,
        results: &[CapabilityCheck],
    ) -> DispatchResult<Option<TaskPackage>> {
        let url = format!("{}/api/tasks/{}/validation", self.base_url, task_id);
        let body = json!({
            "tenant_id": tenant_id,
            "worker_id": worker_id,
            "results": results,
        });
        let response = self.send(self.http_client.post(&url).json(&body)).await?;
        self.optional_data(response).await
    }

    pub async fn decline(
        &self,
        tenant_id: &str,
        worker_id: &str,
        task_id: &str,
    ) -> DispatchResult<()> {
        let url = format!("{}/api/tasks/{}/decline", self.base_url, task_id);
        let body = json!({ "tenant_id": tenant_id, "worker_id": worker_id });
        let response = self.send(self.http_client.post(&url).json(&body)).await?;
        self.check(response).await
    }

    /// 回传执行结果，返回服务端是否接受
    pub async fn submit_response(
        &self,
        tenant_id: &str,
        worker_id: &str,
        task_id: &str,
        result: &TaskResultBody,
    ) -> DispatchResult<bool> {
        let url = format!("{}/api/tasks/{}/response", self.base_url, task_id);
        let body = json!({
            "tenant_id": tenant_id,
            "worker_id": worker_id,
            "response_code": result.response_code,
            "response": result.response,
            "error_message": result.error_message,
        });
        let response = self.send(self.http_client.post(&url).json(&body)).await?;
        let data: serde_json::Value = self.expect_data(response).await?;
        Ok(data
            .get("accepted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> DispatchResult<reqwest::Response> {
        request
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| DispatchError::Internal(format!("Dispatcher连接失败: {e}")))
    }

    async fn optional_data<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> DispatchResult<Option<T>> {
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        self.expect_data(response).await.map(Some)
    }

    async fn expect_data<T: DeserializeOwned>(&self, response: reqwest::Response) -> DispatchResult<T> {
        let response = Self::error_for_status(response).await?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| DispatchError::Serialization(format!("解析Dispatcher响应失败: {e}")))?;
        envelope
            .data
            .ok_or_else(|| DispatchError::Serialization("Dispatcher响应缺少data字段".to_string()))
    }

    async fn check(&self, response: reqwest::Response) -> DispatchResult<()> {
        Self::error_for_status(response).await.map(|_| ())
    }

    /// 把结构化错误还原为对应的错误类型
    async fn error_for_status(response: reqwest::Response) -> DispatchResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        debug!("Dispatcher返回错误: HTTP {} - {}", status, text);
        let Ok(body) = serde_json::from_str::<ErrorEnvelope>(&text) else {
            return Err(DispatchError::Internal(format!(
                "Dispatcher请求失败: HTTP {status} - {text}"
            )));
        };

        let ErrorBody { code, message } = body.error;
        Err(match code.as_str() {
            "INVALID_TOKEN" => DispatchError::InvalidToken(message),
            "VALIDATION_ERROR" => DispatchError::ValidationError(message),
            "TASK_NOT_FOUND" => DispatchError::TaskNotFound { id: message },
            "WORKER_NOT_FOUND" => DispatchError::WorkerNotFound { id: message },
            "TIMEOUT" => DispatchError::Timeout(message),
            _ => DispatchError::Internal(format!("{code}: {message}")),
        })
    }
}
