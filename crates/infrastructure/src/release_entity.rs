use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dispatch_core::models::ReleaseEntity;
use dispatch_core::traits::ReleaseEntityStatusLookup;
use dispatch_core::DispatchResult;
use tokio::sync::RwLock;
use tracing::debug;

/// 执行实体终态登记表
///
/// 工作流/流水线引擎在执行结束时登记，容量约束清理任务据此回收许可。
#[derive(Debug, Clone, Default)]
pub struct InMemoryReleaseEntityRegistry {
    terminal: Arc<RwLock<HashSet<(String, String)>>>,
}

impl InMemoryReleaseEntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark_terminal(&self, entity: &ReleaseEntity) {
        debug!("执行实体 {}:{} 已结束", entity.entity_type, entity.id);
        self.terminal
            .write()
            .await
            .insert((entity.entity_type.clone(), entity.id.clone()));
    }

    /// 许可回收后不再需要保留记录
    pub async fn forget(&self, entity: &ReleaseEntity) -> bool {
        self.terminal
            .write()
            .await
            .remove(&(entity.entity_type.clone(), entity.id.clone()))
    }
}

#[async_trait]
impl ReleaseEntityStatusLookup for InMemoryReleaseEntityRegistry {
    async fn is_terminal(&self, entity: &ReleaseEntity) -> DispatchResult<bool> {
        Ok(self
            .terminal
            .read()
            .await
            .contains(&(entity.entity_type.clone(), entity.id.clone())))
    }
}
