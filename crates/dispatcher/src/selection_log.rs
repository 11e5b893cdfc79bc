use std::sync::Arc;

use chrono::{DateTime, Utc};
use dispatch_core::models::{SelectionLog, SelectionLogBatch, Task};
use dispatch_core::traits::SelectionLogRepository;
use dispatch_core::DispatchResult;
use tracing::{debug, warn};

/// 选择审计日志
///
/// 每次分发尝试开一个批次，判定结束后封存写入；封存后的记录不再修改。
/// Worker在同一次分发尝试内反复轮询得到相同判定时不重复写入。
pub struct SelectionAuditLog {
    repo: Arc<dyn SelectionLogRepository>,
}

impl SelectionAuditLog {
    pub fn new(repo: Arc<dyn SelectionLogRepository>) -> Self {
        Self { repo }
    }

    pub fn begin(&self, task: &Task) -> SelectionLogBatch {
        SelectionLogBatch::new(&task.tenant_id, &task.id, task.broadcast_count)
    }

    /// 封存并持久化，空批次和重复判定不写入
    pub async fn seal(&self, batch: SelectionLogBatch) -> DispatchResult<Option<SelectionLog>> {
        if batch.is_empty() {
            return Ok(None);
        }
        let history = self.repo.list_by_task(batch.tenant_id(), batch.task_id()).await?;
        if history.iter().any(|log| batch.repeats(log)) {
            debug!(
                "任务 {} 第 {} 次分发的判定未变化，跳过写入",
                batch.task_id(),
                batch.attempt()
            );
            return Ok(None);
        }
        let log = batch.seal(Utc::now());
        self.repo.save(&log).await?;
        debug!(
            "任务 {} 第 {} 次分发的选择记录已封存，共 {} 条",
            log.task_id,
            log.attempt,
            log.entries.len()
        );
        Ok(Some(log))
    }

    /// 审计写入失败不影响分发结果
    pub async fn seal_quietly(&self, batch: SelectionLogBatch) {
        let task_id = batch.task_id().to_string();
        if let Err(e) = self.seal(batch).await {
            warn!("保存任务 {} 的选择记录失败: {}", task_id, e);
        }
    }

    /// 删除 `before` 之前封存的记录
    pub async fn purge_before(&self, before: DateTime<Utc>) -> DispatchResult<u64> {
        self.repo.purge_before(before).await
    }

    pub async fn history(&self, tenant_id: &str, task_id: &str) -> DispatchResult<Vec<SelectionLog>> {
        self.repo.list_by_task(tenant_id, task_id).await
    }
}
