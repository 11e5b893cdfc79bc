use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dispatch_core::DispatchError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("分发错误: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("未找到资源: {0}")]
    NotFound(String),

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Self::BadRequest(msg.into())
    }

    /// 面向调用方的错误码
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Dispatch(e) => e.error_code(),
            ApiError::BadRequest(_) => "VALIDATION_ERROR",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "INVALID_TOKEN" => StatusCode::UNAUTHORIZED,
            "CONFLICT" => StatusCode::CONFLICT,
            "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
            "RESOURCE_EXHAUSTED" => StatusCode::TOO_MANY_REQUESTS,
            code if code.ends_with("NOT_FOUND") => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        // 内部错误不把底层细节暴露给调用方
        let message = if status.is_server_error() && status != StatusCode::GATEWAY_TIMEOUT {
            error!("请求处理失败: {}", self);
            "系统内部错误，请稍后重试".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "code": code,
                "message": message,
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ApiError::from(DispatchError::validation_error("bad")),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(DispatchError::invalid_token("x")),
                StatusCode::UNAUTHORIZED,
            ),
            (
                ApiError::from(DispatchError::task_not_found("t")),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(DispatchError::constraint_not_found("c")),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(DispatchError::DuplicateKey("k".to_string())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(DispatchError::Timeout("t".to_string())),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ApiError::Internal("boom".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[test]
    fn test_bad_request_code() {
        let err = ApiError::bad_request("queue不能为空");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
