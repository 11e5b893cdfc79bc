use async_trait::async_trait;

use crate::errors::DispatchResult;

/// 异步响应回调后端，按 `driver_id` 注册
///
/// 响应以序列化后的字节交付，回调方自行解析。
#[async_trait]
pub trait DriverCallback: Send + Sync {
    fn driver_id(&self) -> &str;

    /// 同步调用方经异步通道等待的响应
    async fn publish_sync_task_response(&self, task_id: &str, payload: Vec<u8>)
        -> DispatchResult<()>;

    /// 发出即忘的异步响应
    async fn publish_async_task_response(
        &self,
        task_id: &str,
        payload: Vec<u8>,
    ) -> DispatchResult<()>;
}
