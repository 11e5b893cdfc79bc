use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 已注册的Worker（执行代理）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub id: String,
    pub tenant_id: String,
    pub hostname: String,
    pub ip_address: String,
    /// 自动扩缩容Worker的主机名前缀，不含序号
    pub hostname_prefix: Option<String>,
    pub sequence_number: Option<i32>,
    /// Worker随机会话令牌
    pub token: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 作用域维度，缺失的维度视为不受限制
    #[serde(default)]
    pub scopes: BTreeMap<String, String>,
    pub version: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Worker状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStatus {
    #[serde(rename = "ENABLED")]
    Enabled,
    #[serde(rename = "DISABLED")]
    Disabled,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Enabled => "ENABLED",
            WorkerStatus::Disabled => "DISABLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENABLED" => Some(WorkerStatus::Enabled),
            "DISABLED" => Some(WorkerStatus::Disabled),
            _ => None,
        }
    }
}

impl Worker {
    pub fn is_enabled(&self) -> bool {
        matches!(self.status, WorkerStatus::Enabled)
    }

    /// 检查心跳是否超时
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() > timeout_seconds
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// Worker的一个在线会话，同一Worker可以有多个进程连接
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub id: String,
    pub worker_id: String,
    pub tenant_id: String,
    pub version: String,
    pub last_heartbeat: DateTime<Utc>,
    pub disconnected: bool,
}

/// 序号身份：`(tenant, hostname_prefix, sequence_number) -> token`
///
/// 自动扩缩容的Worker没有稳定主机名，靠序号和令牌在重启后被重新识别。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceIdentity {
    pub id: String,
    pub tenant_id: String,
    pub hostname_prefix: String,
    pub sequence_number: i32,
    pub token: String,
    pub last_updated_at: DateTime<Utc>,
}

impl SequenceIdentity {
    pub fn new(
        tenant_id: impl Into<String>,
        hostname_prefix: impl Into<String>,
        sequence_number: i32,
        token: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            hostname_prefix: hostname_prefix.into(),
            sequence_number,
            token: token.into(),
            last_updated_at: now,
        }
    }

    /// 超过新鲜窗口未刷新即视为过期，可被新实例回收
    pub fn is_stale(&self, now: DateTime<Utc>, freshness_window: Duration) -> bool {
        self.last_updated_at < now - freshness_window
    }

    pub fn matches(&self, sequence_number: i32, token: &str) -> bool {
        !self.token.is_empty() && self.sequence_number == sequence_number && self.token == token
    }

    pub fn hostname(&self) -> String {
        derived_hostname(&self.hostname_prefix, self.sequence_number)
    }
}

/// 带序号的主机名：`prefix_sequenceNumber`
pub fn derived_hostname(prefix: &str, sequence_number: i32) -> String {
    format!("{prefix}_{sequence_number}")
}

/// Worker心跳/注册请求
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatRequest {
    pub tenant_id: String,
    pub hostname_prefix: String,
    pub sequence_number: Option<i32>,
    pub token: Option<String>,
    pub worker_id: Option<String>,
    /// 进程级会话标识，缺省时使用workerId
    pub connection_id: Option<String>,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub scopes: BTreeMap<String, String>,
    #[serde(default)]
    pub version: String,
}

impl HeartbeatRequest {
    /// 空白或字符串"null"的令牌都视为缺失
    pub fn token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("null"))
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}
