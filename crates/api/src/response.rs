use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// 成功响应外壳，Worker客户端按 `data` 字段解析
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_status(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

pub fn success<T: Serialize>(data: T) -> Response {
    ApiResponse::new(data).with_status(StatusCode::OK)
}

/// 已受理但尚未执行，用于异步提交
pub fn accepted<T: Serialize>(data: T) -> Response {
    ApiResponse::new(data)
        .with_message("任务已受理")
        .with_status(StatusCode::ACCEPTED)
}

/// 轮询没有可领取的任务
pub fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_fields() {
        let response = ApiResponse::new("task-1").with_message("已受理");
        assert!(response.success);
        assert_eq!(response.data, Some("task-1"));
        assert_eq!(response.message.as_deref(), Some("已受理"));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["data"], "task-1");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_status_helpers() {
        assert_eq!(accepted("id").status(), StatusCode::ACCEPTED);
        assert_eq!(no_content().status(), StatusCode::NO_CONTENT);
        assert_eq!(success(()).status(), StatusCode::OK);
    }
}
