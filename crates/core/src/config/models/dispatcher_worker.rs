use serde::{Deserialize, Serialize};

/// 分发服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 广播协议版本，参与广播通道的路由
    pub protocol_version: String,
    /// 维护循环间隔
    pub maintenance_interval_seconds: u64,
    /// 首次重新广播的延迟
    pub broadcast_interval_seconds: u64,
    /// 重新广播的退避上限
    pub broadcast_backoff_max_seconds: u64,
    /// 退避时间的随机抖动比例（0.0-1.0）
    pub broadcast_jitter_factor: f64,
    /// 超过该广播次数仍未被领取的任务强制失败
    pub max_broadcast_rounds: i32,
    /// 单次拉取时扫描的候选任务数
    pub acquire_batch_size: i64,
    /// Worker领取验证后迟迟不回报，超过该时长释放验证并重新广播
    pub validation_timeout_seconds: i64,
    pub whitelist_ttl_seconds: i64,
    pub blacklist_ttl_seconds: i64,
    /// 同步等待的默认超时
    pub default_sync_timeout_ms: i64,
    /// 终态任务保留时长
    pub retention_hours: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol_version: "v1".to_string(),
            maintenance_interval_seconds: 5,
            broadcast_interval_seconds: 5,
            broadcast_backoff_max_seconds: 60,
            broadcast_jitter_factor: 0.1,
            max_broadcast_rounds: 20,
            acquire_batch_size: 20,
            validation_timeout_seconds: 12,
            whitelist_ttl_seconds: 6 * 60 * 60,
            blacklist_ttl_seconds: 5 * 60,
            default_sync_timeout_ms: 60_000,
            retention_hours: 24,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.protocol_version.trim().is_empty() {
            return Err(anyhow::anyhow!("广播协议版本不能为空"));
        }

        if self.maintenance_interval_seconds == 0 {
            return Err(anyhow::anyhow!("维护循环间隔必须大于0"));
        }

        if self.broadcast_interval_seconds == 0 {
            return Err(anyhow::anyhow!("广播间隔必须大于0"));
        }

        if self.broadcast_backoff_max_seconds < self.broadcast_interval_seconds {
            return Err(anyhow::anyhow!(
                "广播退避上限({})不能小于广播间隔({})",
                self.broadcast_backoff_max_seconds,
                self.broadcast_interval_seconds
            ));
        }

        if !(0.0..=1.0).contains(&self.broadcast_jitter_factor) {
            return Err(anyhow::anyhow!(
                "广播抖动比例必须在0.0到1.0之间: {}",
                self.broadcast_jitter_factor
            ));
        }

        if self.max_broadcast_rounds <= 0 {
            return Err(anyhow::anyhow!("最大广播次数必须大于0"));
        }

        if self.acquire_batch_size <= 0 {
            return Err(anyhow::anyhow!("拉取批量大小必须大于0"));
        }

        if self.validation_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("能力验证超时必须大于0"));
        }

        if self.whitelist_ttl_seconds <= 0 || self.blacklist_ttl_seconds <= 0 {
            return Err(anyhow::anyhow!("白名单/黑名单有效期必须大于0"));
        }

        if self.default_sync_timeout_ms <= 0 {
            return Err(anyhow::anyhow!("同步等待超时必须大于0"));
        }

        if self.retention_hours <= 0 {
            return Err(anyhow::anyhow!("任务保留时长必须大于0"));
        }

        Ok(())
    }
}

/// Worker身份协调配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// 序号身份的新鲜窗口，超过即可被回收
    pub freshness_window_seconds: i64,
    /// 新序号分配遇到并发冲突时的尝试次数
    pub allocation_attempts: u32,
    /// 连接心跳超时，超时后标记为断开
    pub connection_timeout_seconds: i64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            freshness_window_seconds: 100,
            allocation_attempts: 3,
            connection_timeout_seconds: 90,
        }
    }
}

impl IdentityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.freshness_window_seconds <= 0 {
            return Err(anyhow::anyhow!("身份新鲜窗口必须大于0"));
        }

        if self.allocation_attempts == 0 {
            return Err(anyhow::anyhow!("序号分配尝试次数必须大于0"));
        }

        if self.connection_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }

        Ok(())
    }
}

/// 准入控制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// `ensure` 新建约束时的容量
    pub default_capacity: i32,
    pub sweep_interval_seconds: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_capacity: 1,
            sweep_interval_seconds: 60,
        }
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_capacity < 1 {
            return Err(anyhow::anyhow!("默认容量必须至少为1"));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("清理间隔必须大于0"));
        }

        Ok(())
    }
}

/// Worker代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub tenant_id: String,
    pub dispatcher_url: String,
    /// 主机名前缀，为空时取本机主机名
    pub hostname_prefix: String,
    pub queue: String,
    pub tags: Vec<String>,
    /// 身份文件，保存workerId/序号/令牌
    pub identity_file: String,
    pub supported_task_types: Vec<String>,
    pub heartbeat_interval_seconds: u64,
    pub task_poll_interval_seconds: u64,
    /// 验证连通性时单个条件的超时
    pub probe_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tenant_id: "default".to_string(),
            dispatcher_url: "http://127.0.0.1:8080".to_string(),
            hostname_prefix: String::new(),
            queue: "default".to_string(),
            tags: Vec::new(),
            identity_file: "worker-identity.json".to_string(),
            supported_task_types: vec!["shell".to_string(), "http".to_string()],
            heartbeat_interval_seconds: 30,
            task_poll_interval_seconds: 5,
            probe_timeout_ms: 3000,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(anyhow::anyhow!("租户ID不能为空"));
        }

        if !self.dispatcher_url.starts_with("http://") && !self.dispatcher_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "Dispatcher地址必须是HTTP(S)格式: {}",
                self.dispatcher_url
            ));
        }

        if self.queue.trim().is_empty() {
            return Err(anyhow::anyhow!("队列不能为空"));
        }

        if self.identity_file.trim().is_empty() {
            return Err(anyhow::anyhow!("身份文件路径不能为空"));
        }

        if self.supported_task_types.is_empty() {
            return Err(anyhow::anyhow!("支持的任务类型不能为空"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.task_poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }

        if self.probe_timeout_ms == 0 {
            return Err(anyhow::anyhow!("探测超时必须大于0"));
        }

        Ok(())
    }
}
