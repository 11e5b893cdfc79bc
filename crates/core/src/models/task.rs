use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DispatchError, DispatchResult};

/// 标记下一代任务的作用域维度，广播时路由到独立通道
pub const NG_ABSTRACTION_KEY: &str = "ng";

/// 分发任务
///
/// 由提交方创建，经广播通知候选Worker，再由Worker通过拉取接口原子领取。
///
/// # 字段说明
///
/// - `queue`: Worker拉取时匹配的队列标识
/// - `setup_abstractions`: 作用域维度，候选Worker必须全部满足
/// - `selectors`: Worker必须具备的标签
/// - `capabilities`: 执行前需要验证的连通性条件（如 `host:port`），组成任务签名
/// - `pre_assigned_worker_id`: 首轮广播建议的Worker，仅作提示
/// - `must_execute_on_worker_id`: 点对点任务，只能由该Worker执行且不广播
/// - `already_tried`: 已拒绝或验证失败的Worker，重新广播时不再作为新候选
/// - `wait_id` / `driver_id`: 响应关联所需的令牌和回调后端
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub tenant_id: String,
    pub queue: String,
    pub version: String,
    pub data: TaskData,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub pre_assigned_worker_id: Option<String>,
    pub must_execute_on_worker_id: Option<String>,
    #[serde(default)]
    pub already_tried: Vec<String>,
    #[serde(default)]
    pub validating_worker_ids: Vec<String>,
    pub validation_started_at: Option<DateTime<Utc>>,
    pub broadcast_count: i32,
    pub next_broadcast_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub status: TaskStatus,
    pub wait_id: Option<String>,
    pub driver_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 任务负载描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskData {
    pub task_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub timeout_ms: i64,
    #[serde(default)]
    pub is_async: bool,
}

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "FINISHED")]
    Finished,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Started => "STARTED",
            TaskStatus::Aborted => "ABORTED",
            TaskStatus::Error => "ERROR",
            TaskStatus::Finished => "FINISHED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Aborted | TaskStatus::Error | TaskStatus::Finished
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(TaskStatus::Queued),
            "STARTED" => Ok(TaskStatus::Started),
            "ABORTED" => Ok(TaskStatus::Aborted),
            "ERROR" => Ok(TaskStatus::Error),
            "FINISHED" => Ok(TaskStatus::Finished),
            _ => Err(DispatchError::Serialization(format!(
                "Invalid task status: {s}"
            ))),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse::<TaskStatus>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

impl Task {
    /// 创建新的排队任务，过期时间按超时计算
    pub fn new(tenant_id: impl Into<String>, queue: impl Into<String>, data: TaskData) -> Self {
        let now = Utc::now();
        // 超出时间范围的超时在 validate 中拒绝
        let expires_at = deadline_after(now, data.timeout_ms).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            queue: queue.into(),
            version: String::new(),
            data,
            setup_abstractions: BTreeMap::new(),
            selectors: Vec::new(),
            capabilities: Vec::new(),
            pre_assigned_worker_id: None,
            must_execute_on_worker_id: None,
            already_tried: Vec::new(),
            validating_worker_ids: Vec::new(),
            validation_started_at: None,
            broadcast_count: 0,
            next_broadcast_at: None,
            worker_id: None,
            status: TaskStatus::Queued,
            wait_id: None,
            driver_id: None,
            created_at: now,
            expires_at,
            updated_at: now,
        }
    }

    pub fn with_selectors(mut self, selectors: Vec<String>) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_abstraction(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions.insert(key.into(), value.into());
        self
    }

    pub fn with_driver(mut self, driver_id: impl Into<String>) -> Self {
        self.driver_id = Some(driver_id.into());
        self
    }

    pub fn pinned_to(mut self, worker_id: impl Into<String>) -> Self {
        self.must_execute_on_worker_id = Some(worker_id.into());
        self
    }

    pub fn is_async(&self) -> bool {
        self.data.is_async
    }

    /// 作用域中 `ng=true` 的任务走下一代广播通道
    pub fn is_next_gen(&self) -> bool {
        self.setup_abstractions
            .get(NG_ABSTRACTION_KEY)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn is_assigned(&self) -> bool {
        self.worker_id.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// 任务是否被固定在其他Worker上
    pub fn is_pinned_elsewhere(&self, worker_id: &str) -> bool {
        self.must_execute_on_worker_id
            .as_deref()
            .map(|pinned| pinned != worker_id)
            .unwrap_or(false)
    }

    pub fn has_tried(&self, worker_id: &str) -> bool {
        self.already_tried.iter().any(|id| id == worker_id)
    }

    pub fn mark_tried(&mut self, worker_id: &str) {
        if !self.has_tried(worker_id) {
            self.already_tried.push(worker_id.to_string());
        }
        self.validating_worker_ids.retain(|id| id != worker_id);
    }

    pub fn is_validating(&self, worker_id: &str) -> bool {
        self.validating_worker_ids.iter().any(|id| id == worker_id)
    }

    /// 任务签名：排序去重后的能力条件，用于白名单匹配
    pub fn signature(&self) -> Vec<String> {
        let mut criteria = self.capabilities.clone();
        criteria.sort();
        criteria.dedup();
        criteria
    }

    /// 提交前的参数校验
    pub fn validate(&self) -> DispatchResult<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(DispatchError::validation_error("tenant_id不能为空"));
        }
        if self.queue.trim().is_empty() {
            return Err(DispatchError::validation_error("queue不能为空"));
        }
        if self.data.task_type.trim().is_empty() {
            return Err(DispatchError::validation_error("task_type不能为空"));
        }
        if self.data.timeout_ms <= 0 {
            return Err(DispatchError::validation_error(format!(
                "timeout_ms必须大于0，当前值: {}",
                self.data.timeout_ms
            )));
        }
        deadline_after(self.created_at, self.data.timeout_ms)?;
        if self.status != TaskStatus::Queued {
            return Err(DispatchError::validation_error(format!(
                "新提交的任务状态必须为QUEUED，当前状态: {}",
                self.status
            )));
        }
        Ok(())
    }
}

/// `now` 之后 `timeout_ms` 毫秒的时间点，超出可表示范围时返回校验错误
pub fn deadline_after(now: DateTime<Utc>, timeout_ms: i64) -> DispatchResult<DateTime<Utc>> {
    Duration::try_milliseconds(timeout_ms.max(0))
        .and_then(|timeout| now.checked_add_signed(timeout))
        .ok_or_else(|| {
            DispatchError::validation_error(format!("timeout_ms超出范围: {timeout_ms}"))
        })
}

/// Worker回传的结果码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResponseCode {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "RETRY_ON_OTHER_WORKER")]
    RetryOnOtherWorker,
}

impl ResponseCode {
    /// 结果码对应的终态，`RetryOnOtherWorker` 不产生终态
    pub fn terminal_status(&self) -> Option<TaskStatus> {
        match self {
            ResponseCode::Ok => Some(TaskStatus::Finished),
            ResponseCode::Failed => Some(TaskStatus::Error),
            ResponseCode::RetryOnOtherWorker => None,
        }
    }
}

/// 任务执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResponse {
    pub task_id: String,
    pub response_code: ResponseCode,
    #[serde(default)]
    pub response: serde_json::Value,
    pub error_message: Option<String>,
    #[serde(default)]
    pub expired: bool,
}

impl TaskResponse {
    pub fn ok(task_id: impl Into<String>, response: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            response_code: ResponseCode::Ok,
            response,
            error_message: None,
            expired: false,
        }
    }

    pub fn failed(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            response_code: ResponseCode::Failed,
            response: serde_json::Value::Null,
            error_message: Some(message.into()),
            expired: false,
        }
    }

    pub fn expired(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            expired: true,
            ..Self::failed(task_id, message)
        }
    }
}

/// 交给Worker的任务包
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPackage {
    pub task: Task,
    /// 为true时Worker需要先验证能力条件并回报结果，任务尚未真正分配
    pub validation_required: bool,
}

/// Worker对单个能力条件的验证结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityCheck {
    pub criteria: String,
    pub validated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell_task() -> Task {
        Task::new(
            "tenant-1",
            "default",
            TaskData {
                task_type: "shell".to_string(),
                parameters: json!({"command": "echo hi"}),
                timeout_ms: 60_000,
                is_async: false,
            },
        )
    }

    #[test]
    fn test_new_task_is_queued_and_unassigned() {
        let task = shell_task();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(!task.is_assigned());
        assert_eq!(task.broadcast_count, 0);
        assert!(task.expires_at > task.created_at);
    }

    #[test]
    fn test_oversized_timeout_is_rejected() {
        let task = Task::new(
            "tenant-1",
            "default",
            TaskData {
                task_type: "shell".to_string(),
                parameters: serde_json::Value::Null,
                timeout_ms: i64::MAX,
                is_async: false,
            },
        );

        let err = task.validate().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(deadline_after(Utc::now(), i64::MAX).is_err());
        assert!(deadline_after(Utc::now(), 60_000).is_ok());
    }

    #[test]
    fn test_next_gen_routing_flag() {
        assert!(!shell_task().is_next_gen());
        assert!(shell_task().with_abstraction("ng", "TRUE").is_next_gen());
        assert!(!shell_task().with_abstraction("ng", "false").is_next_gen());
    }

    #[test]
    fn test_mark_tried_is_idempotent_and_clears_validation() {
        let mut task = shell_task();
        task.validating_worker_ids.push("w1".to_string());
        task.mark_tried("w1");
        task.mark_tried("w1");
        assert_eq!(task.already_tried, vec!["w1".to_string()]);
        assert!(!task.is_validating("w1"));
    }

    #[test]
    fn test_signature_sorted_and_deduplicated() {
        let task = shell_task().with_capabilities(vec![
            "b.example:443".to_string(),
            "a.example:22".to_string(),
            "b.example:443".to_string(),
        ]);
        assert_eq!(task.signature(), vec!["a.example:22", "b.example:443"]);
    }

    #[test]
    fn test_pinned_elsewhere() {
        let task = shell_task().pinned_to("w1");
        assert!(task.is_pinned_elsewhere("w2"));
        assert!(!task.is_pinned_elsewhere("w1"));
        assert!(!shell_task().is_pinned_elsewhere("w2"));
    }

    #[test]
    fn test_validate_rejects_bad_timeout() {
        let mut task = shell_task();
        task.data.timeout_ms = 0;
        assert!(matches!(
            task.validate(),
            Err(DispatchError::ValidationError(_))
        ));
    }

    #[test]
    fn test_status_round_trip_and_terminal() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Started,
            TaskStatus::Aborted,
            TaskStatus::Error,
            TaskStatus::Finished,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!(TaskStatus::Finished.is_terminal());
        assert!(!TaskStatus::Started.is_terminal());
    }

    #[test]
    fn test_response_code_terminal_status() {
        assert_eq!(ResponseCode::Ok.terminal_status(), Some(TaskStatus::Finished));
        assert_eq!(ResponseCode::Failed.terminal_status(), Some(TaskStatus::Error));
        assert_eq!(ResponseCode::RetryOnOtherWorker.terminal_status(), None);
    }
}
