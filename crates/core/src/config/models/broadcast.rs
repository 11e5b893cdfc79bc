use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastBackend {
    Memory,
    Redis,
}

/// 广播通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub backend: BroadcastBackend,
    pub redis_url: String,
    /// 进程内广播的缓冲容量
    pub channel_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            backend: BroadcastBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel_capacity: 1024,
        }
    }
}

impl BroadcastConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == BroadcastBackend::Redis
            && !self.redis_url.starts_with("redis://")
            && !self.redis_url.starts_with("rediss://")
        {
            return Err(anyhow::anyhow!("Redis URL格式无效: {}", self.redis_url));
        }

        if self.channel_capacity == 0 {
            return Err(anyhow::anyhow!("广播缓冲容量必须大于0"));
        }

        Ok(())
    }
}
