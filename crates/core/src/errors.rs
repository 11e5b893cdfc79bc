use thiserror::Error;

/// 分发系统错误类型定义
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("容量约束未找到: {id}")]
    ConstraintNotFound { id: String },

    #[error("无效的Worker身份令牌: {0}")]
    InvalidToken(String),

    #[error("数据验证失败: {0}")]
    ValidationError(String),

    #[error("唯一键冲突: {0}")]
    DuplicateKey(String),

    #[error("广播通道错误: {0}")]
    Broadcast(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("资源不足: {0}")]
    ResourceExhausted(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }
    pub fn constraint_not_found<S: Into<String>>(id: S) -> Self {
        Self::ConstraintNotFound { id: id.into() }
    }
    pub fn invalid_token<S: Into<String>>(msg: S) -> Self {
        Self::InvalidToken(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 竞争失败（CAS落败、并发创建重复键），调用方重新读取即可
    pub fn is_race_loss(&self) -> bool {
        match self {
            DispatchError::DuplicateKey(_) => true,
            DispatchError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::DatabaseOperation(_)
                | DispatchError::Broadcast(_)
                | DispatchError::Timeout(_)
        ) || self.is_race_loss()
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::Internal(_) | DispatchError::Configuration(_)
        )
    }

    /// 面向调用方的错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            DispatchError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            DispatchError::WorkerNotFound { .. } => "WORKER_NOT_FOUND",
            DispatchError::ConstraintNotFound { .. } => "CONSTRAINT_NOT_FOUND",
            DispatchError::InvalidToken(_) => "INVALID_TOKEN",
            DispatchError::ValidationError(_) => "VALIDATION_ERROR",
            DispatchError::DuplicateKey(_) => "CONFLICT",
            DispatchError::Timeout(_) => "TIMEOUT",
            DispatchError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            _ => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_key_is_race_loss() {
        let err = DispatchError::DuplicateKey("constraints(tenant, name)".to_string());
        assert!(err.is_race_loss());
        assert!(err.is_retryable());
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[test]
    fn test_invalid_token_is_distinct() {
        let err = DispatchError::invalid_token("缺少workerId与token");
        assert!(!err.is_retryable());
        assert_eq!(err.error_code(), "INVALID_TOKEN");
        assert!(err.to_string().contains("缺少workerId与token"));
    }

    #[test]
    fn test_validation_error_not_retryable() {
        let err = DispatchError::validation_error("capacity不能小于当前占用");
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }
}
