use std::path::{Path, PathBuf};

use dispatch_core::models::Worker;
use dispatch_core::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 本地持久化的Worker身份
///
/// 重启后带着同一组 `{workerId, sequenceNumber, token}` 心跳，服务端据此认回原来的序号。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerIdentity {
    pub worker_id: Option<String>,
    pub sequence_number: Option<i32>,
    pub token: String,
}

impl WorkerIdentity {
    pub fn fresh() -> Self {
        Self {
            worker_id: None,
            sequence_number: None,
            token: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// 用服务端返回的记录刷新身份，返回是否有变化
    pub fn update_from(&mut self, worker: &Worker) -> bool {
        let mut changed = false;
        if self.worker_id.as_deref() != Some(worker.id.as_str()) {
            self.worker_id = Some(worker.id.clone());
            changed = true;
        }
        if worker.sequence_number.is_some() && self.sequence_number != worker.sequence_number {
            self.sequence_number = worker.sequence_number;
            changed = true;
        }
        if let Some(token) = worker.token.as_deref() {
            if token != self.token {
                self.token = token.to_string();
                changed = true;
            }
        }
        changed
    }
}

/// 身份文件读写
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取身份，文件不存在时生成新令牌并落盘
    pub async fn load_or_create(&self) -> DispatchResult<WorkerIdentity> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let identity: WorkerIdentity = serde_json::from_str(&content)?;
                debug!("从 {} 读取Worker身份", self.path.display());
                Ok(identity)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = WorkerIdentity::fresh();
                self.save(&identity).await?;
                info!("生成新的Worker身份: {}", self.path.display());
                Ok(identity)
            }
            Err(e) => Err(DispatchError::Internal(format!(
                "读取身份文件 {} 失败: {e}",
                self.path.display()
            ))),
        }
    }

    /// 先写临时文件再改名，避免写到一半的文件
    pub async fn save(&self, identity: &WorkerIdentity) -> DispatchResult<()> {
        let content = serde_json::to_string_pretty(identity)?;
        let tmp = self.path.with_extension("json.tmp");

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DispatchError::Internal(format!("创建身份目录失败: {e}")))?;
        }
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| DispatchError::Internal(format!("写入身份文件失败: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| DispatchError::Internal(format!("替换身份文件失败: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dispatch_core::models::WorkerStatus;
    use std::collections::BTreeMap;

    fn worker(id: &str, seq: i32, token: &str) -> Worker {
        Worker {
            id: id.to_string(),
            tenant_id: "t".to_string(),
            hostname: format!("ecs_{seq}"),
            ip_address: "10.0.0.1".to_string(),
            hostname_prefix: Some("ecs".to_string()),
            sequence_number: Some(seq),
            token: Some(token.to_string()),
            tags: Vec::new(),
            scopes: BTreeMap::new(),
            version: "1.0.0".to_string(),
            status: WorkerStatus::Enabled,
            last_heartbeat: Utc::now(),
            registered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_creates_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("nested").join("identity.json"));

        let first = store.load_or_create().await.unwrap();
        assert!(first.worker_id.is_none());
        assert!(!first.token.is_empty());
        assert!(store.path().exists());

        // 再次读取拿到同一个令牌
        let second = store.load_or_create().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_update_from_server_record_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("identity.json"));
        let mut identity = store.load_or_create().await.unwrap();
        let token = identity.token.clone();

        assert!(identity.update_from(&worker("w-1", 2, &token)));
        assert!(!identity.update_from(&worker("w-1", 2, &token)));
        store.save(&identity).await.unwrap();

        let reloaded = store.load_or_create().await.unwrap();
        assert_eq!(reloaded.worker_id.as_deref(), Some("w-1"));
        assert_eq!(reloaded.sequence_number, Some(2));
        assert_eq!(reloaded.token, token);
    }

    #[tokio::test]
    async fn test_corrupted_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let store = IdentityStore::new(path);
        assert!(store.load_or_create().await.is_err());
    }
}
