use async_trait::async_trait;

use crate::errors::DispatchResult;
use crate::models::ReleaseEntity;

/// 查询执行实体（工作流/流水线执行）是否已结束
#[async_trait]
pub trait ReleaseEntityStatusLookup: Send + Sync {
    async fn is_terminal(&self, entity: &ReleaseEntity) -> DispatchResult<bool>;
}
