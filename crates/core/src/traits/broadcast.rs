use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::DispatchResult;
use crate::models::{BroadcastChannel, BroadcastMessage};

/// 广播发布端
#[async_trait]
pub trait BroadcastPublisher: Send + Sync {
    async fn publish(
        &self,
        channel: &BroadcastChannel,
        message: &BroadcastMessage,
    ) -> DispatchResult<()>;
}

/// 广播订阅端，Worker用来在轮询间隔内被提前唤醒
#[async_trait]
pub trait BroadcastSubscriber: Send + Sync {
    async fn subscribe(
        &self,
        channel: &BroadcastChannel,
    ) -> DispatchResult<mpsc::Receiver<BroadcastMessage>>;
}
