//! Worker身份协调
//!
//! 自动扩缩容的Worker没有稳定主机名，重启后靠 `(hostname_prefix, sequence_number, token)`
//! 被重新识别。解析顺序：
//!
//! 1. 携带workerId：直接按ID更新
//! 2. 携带序号和令牌：令牌匹配则沿用 `prefix_序号` 对应的Worker
//! 3. 回收一个超过新鲜窗口未刷新的序号，删除原先绑定的Worker
//! 4. 分配当前未使用的最小序号

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dispatch_core::config::IdentityConfig;
use dispatch_core::models::{Connection, HeartbeatRequest, SequenceIdentity, Worker, WorkerStatus};
use dispatch_core::traits::{ConnectionRepository, SequenceRepository, WorkerRepository};
use dispatch_core::{DispatchError, DispatchResult};
use tracing::{debug, info, warn};

/// 未被占用的最小序号
pub fn next_free_sequence(used: &[i32]) -> i32 {
    let used: BTreeSet<i32> = used.iter().copied().filter(|n| *n >= 0).collect();
    (0..).find(|n| !used.contains(n)).unwrap_or(0)
}

/// 最小的过期序号
pub fn find_stale(
    identities: &[SequenceIdentity],
    now: DateTime<Utc>,
    freshness_window: Duration,
) -> Option<&SequenceIdentity> {
    identities
        .iter()
        .filter(|identity| identity.is_stale(now, freshness_window))
        .min_by_key(|identity| identity.sequence_number)
}

pub struct WorkerIdentityReconciler {
    workers: Arc<dyn WorkerRepository>,
    connections: Arc<dyn ConnectionRepository>,
    sequences: Arc<dyn SequenceRepository>,
    config: IdentityConfig,
}

impl WorkerIdentityReconciler {
    pub fn new(
        workers: Arc<dyn WorkerRepository>,
        connections: Arc<dyn ConnectionRepository>,
        sequences: Arc<dyn SequenceRepository>,
        config: IdentityConfig,
    ) -> Self {
        Self {
            workers,
            connections,
            sequences,
            config,
        }
    }

    fn freshness_window(&self) -> Duration {
        Duration::seconds(self.config.freshness_window_seconds)
    }

    /// 处理一次心跳/注册，返回解析出的Worker
    pub async fn reconcile(&self, request: &HeartbeatRequest) -> DispatchResult<Worker> {
        if request.tenant_id.trim().is_empty() {
            return Err(DispatchError::validation_error("tenant_id不能为空"));
        }
        if request.hostname_prefix.trim().is_empty() {
            return Err(DispatchError::validation_error("hostname_prefix不能为空"));
        }
        if request.worker_id().is_none() && request.token().is_none() {
            warn!(
                "租户 {} 前缀 {} 的Worker既没有workerId也没有token",
                request.tenant_id, request.hostname_prefix
            );
            return Err(DispatchError::invalid_token("缺少workerId与token"));
        }

        let now = Utc::now();
        let worker = self.resolve(request, now).await?;

        let connection = Connection {
            id: request
                .connection_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| worker.id.clone()),
            worker_id: worker.id.clone(),
            tenant_id: worker.tenant_id.clone(),
            version: request.version.clone(),
            last_heartbeat: now,
            disconnected: false,
        };
        self.connections.heartbeat(&connection).await?;
        Ok(worker)
    }

    async fn resolve(&self, request: &HeartbeatRequest, now: DateTime<Utc>) -> DispatchResult<Worker> {
        if let Some(worker) = self.by_worker_id(request, now).await? {
            return Ok(worker);
        }

        let Some(token) = request.token() else {
            return Err(DispatchError::invalid_token(format!(
                "workerId {:?} 未注册且缺少token",
                request.worker_id()
            )));
        };

        if let Some(worker) = self.by_sequence_token(request, token, now).await? {
            return Ok(worker);
        }
        if let Some(worker) = self.reclaim_stale(request, token, now).await? {
            return Ok(worker);
        }
        self.allocate(request, token, now).await
    }

    async fn by_worker_id(
        &self,
        request: &HeartbeatRequest,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Worker>> {
        let Some(worker_id) = request.worker_id() else {
            return Ok(None);
        };
        let Some(existing) = self.workers.get(worker_id).await? else {
            debug!("workerId {} 未注册，继续按序号解析", worker_id);
            return Ok(None);
        };
        if existing.tenant_id != request.tenant_id {
            return Err(DispatchError::invalid_token(format!(
                "workerId {worker_id} 不属于租户 {}",
                request.tenant_id
            )));
        }

        if let (Some(prefix), Some(seq), Some(token)) = (
            existing.hostname_prefix.as_deref(),
            existing.sequence_number,
            existing.token.as_deref(),
        ) {
            self.sequences
                .touch(&existing.tenant_id, prefix, seq, token, now)
                .await?;
        }

        let worker = self.workers.upsert(&refreshed(existing, request, now)).await?;
        debug!("Worker {} 按ID刷新心跳", worker.id);
        Ok(Some(worker))
    }

    async fn by_sequence_token(
        &self,
        request: &HeartbeatRequest,
        token: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Worker>> {
        let Some(seq) = request.sequence_number else {
            return Ok(None);
        };
        let identity = self
            .sequences
            .get(&request.tenant_id, &request.hostname_prefix, seq)
            .await?;
        match identity {
            Some(identity) if identity.matches(seq, token) => {
                self.sequences
                    .touch(&request.tenant_id, &request.hostname_prefix, seq, token, now)
                    .await?;
                let worker = self.bind(request, &identity, token, now).await?;
                debug!("Worker {} 按序号 {} 重新识别", worker.id, seq);
                Ok(Some(worker))
            }
            _ => {
                debug!(
                    "序号 {}_{} 的令牌不匹配，按新实例处理",
                    request.hostname_prefix, seq
                );
                Ok(None)
            }
        }
    }

    async fn reclaim_stale(
        &self,
        request: &HeartbeatRequest,
        token: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Worker>> {
        let identities = self
            .sequences
            .list(&request.tenant_id, &request.hostname_prefix)
            .await?;
        let window = self.freshness_window();
        let Some(stale) = find_stale(&identities, now, window) else {
            return Ok(None);
        };

        if !self
            .sequences
            .rebind_if_stale(&stale.id, token, now - window, now)
            .await?
        {
            debug!("序号 {} 已被其他实例回收", stale.hostname());
            return Ok(None);
        }

        let hostname = stale.hostname();
        if let Some(previous) = self
            .workers
            .find_by_hostname(&request.tenant_id, &hostname)
            .await?
        {
            self.workers.delete(&previous.id).await?;
            info!("回收过期序号 {}，删除原Worker {}", hostname, previous.id);
        }

        let mut identity = stale.clone();
        identity.token = token.to_string();
        identity.last_updated_at = now;
        Ok(Some(self.bind(request, &identity, token, now).await?))
    }

    async fn allocate(
        &self,
        request: &HeartbeatRequest,
        token: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Worker> {
        let mut last_error = None;
        for attempt in 1..=self.config.allocation_attempts {
            let used: Vec<i32> = self
                .sequences
                .list(&request.tenant_id, &request.hostname_prefix)
                .await?
                .iter()
                .map(|identity| identity.sequence_number)
                .collect();
            let seq = next_free_sequence(&used);
            let identity = SequenceIdentity::new(
                &request.tenant_id,
                &request.hostname_prefix,
                seq,
                token,
                now,
            );

            match self.sequences.insert(&identity).await {
                Ok(()) => {
                    let worker = self.bind(request, &identity, token, now).await?;
                    info!("为Worker {} 分配新序号 {}", worker.id, identity.hostname());
                    return Ok(worker);
                }
                Err(e) if e.is_race_loss() => {
                    debug!("序号 {} 分配冲突（第 {} 次尝试）", seq, attempt);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DispatchError::ResourceExhausted(format!(
                "前缀 {} 的序号分配失败",
                request.hostname_prefix
            ))
        }))
    }

    /// 按序号身份更新或创建Worker记录
    async fn bind(
        &self,
        request: &HeartbeatRequest,
        identity: &SequenceIdentity,
        token: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Worker> {
        let hostname = identity.hostname();
        let existing = self
            .workers
            .find_by_hostname(&request.tenant_id, &hostname)
            .await?;

        let worker = match existing {
            Some(existing) => {
                let mut worker = refreshed(existing, request, now);
                worker.token = Some(token.to_string());
                worker
            }
            None => Worker {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: request.tenant_id.clone(),
                hostname,
                ip_address: request.ip_address.clone(),
                hostname_prefix: Some(identity.hostname_prefix.clone()),
                sequence_number: Some(identity.sequence_number),
                token: Some(token.to_string()),
                tags: request.tags.clone(),
                scopes: request.scopes.clone(),
                version: request.version.clone(),
                status: WorkerStatus::Enabled,
                last_heartbeat: now,
                registered_at: now,
            },
        };
        self.workers.upsert(&worker).await
    }

    /// 刷新序号身份，令牌不匹配时返回 `false`
    pub async fn keep_alive(
        &self,
        tenant_id: &str,
        hostname_prefix: &str,
        sequence_number: i32,
        token: &str,
    ) -> DispatchResult<bool> {
        self.sequences
            .touch(tenant_id, hostname_prefix, sequence_number, token, Utc::now())
            .await
    }

    /// 标记心跳超时的会话为断开
    pub async fn disconnect_stale(&self, now: DateTime<Utc>) -> DispatchResult<u64> {
        let before = now - Duration::seconds(self.config.connection_timeout_seconds);
        let count = self.connections.disconnect_stale(before).await?;
        if count > 0 {
            info!("{} 个Worker会话心跳超时，已标记断开", count);
        }
        Ok(count)
    }

    /// 在线且启用的Worker
    pub async fn connected_workers(&self, tenant_id: &str) -> DispatchResult<Vec<Worker>> {
        let since = Utc::now() - Duration::seconds(self.config.connection_timeout_seconds);
        let connected = self.connections.connected_worker_ids(tenant_id, since).await?;
        let workers = self.workers.list_enabled(tenant_id).await?;
        Ok(workers
            .into_iter()
            .filter(|w| connected.iter().any(|id| id == &w.id))
            .collect())
    }

    pub async fn is_connected(&self, worker: &Worker) -> DispatchResult<bool> {
        let since = Utc::now() - Duration::seconds(self.config.connection_timeout_seconds);
        let connected = self
            .connections
            .connected_worker_ids(&worker.tenant_id, since)
            .await?;
        Ok(connected.iter().any(|id| id == &worker.id))
    }
}

fn refreshed(mut worker: Worker, request: &HeartbeatRequest, now: DateTime<Utc>) -> Worker {
    if !request.ip_address.is_empty() {
        worker.ip_address = request.ip_address.clone();
    }
    if !request.version.is_empty() {
        worker.version = request.version.clone();
    }
    worker.tags = request.tags.clone();
    worker.scopes = request.scopes.clone();
    worker.last_heartbeat = now;
    worker
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_free_sequence_reuses_gaps() {
        assert_eq!(next_free_sequence(&[]), 0);
        assert_eq!(next_free_sequence(&[0, 1, 3]), 2);
        assert_eq!(next_free_sequence(&[0, 1, 2]), 3);
        assert_eq!(next_free_sequence(&[1, 2]), 0);
        assert_eq!(next_free_sequence(&[2, 0, 1, 0]), 3);
    }

    #[test]
    fn test_find_stale_prefers_lowest_sequence() {
        let now = Utc::now();
        let old = now - Duration::seconds(500);
        let identities = vec![
            SequenceIdentity::new("t", "ecs", 4, "a", old),
            SequenceIdentity::new("t", "ecs", 1, "b", old),
            SequenceIdentity::new("t", "ecs", 0, "c", now),
        ];
        let stale = find_stale(&identities, now, Duration::seconds(100)).unwrap();
        assert_eq!(stale.sequence_number, 1);
        assert!(find_stale(&identities[2..], now, Duration::seconds(100)).is_none());
    }
}
