use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dispatch_core::models::{BroadcastChannel, BroadcastMessage};
use dispatch_core::traits::{BroadcastPublisher, BroadcastSubscriber};
use dispatch_core::DispatchResult;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

/// 进程内广播总线
///
/// 每个主题一个 `tokio::sync::broadcast` 通道；没有订阅者时发布的消息直接丢弃，
/// 与发布/订阅语义一致。
#[derive(Debug, Clone)]
pub struct InMemoryBroadcastBus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<BroadcastMessage>>>>,
    capacity: usize,
}

impl InMemoryBroadcastBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<BroadcastMessage> {
        if let Some(sender) = self.topics.read().await.get(topic) {
            return sender.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl BroadcastPublisher for InMemoryBroadcastBus {
    async fn publish(
        &self,
        channel: &BroadcastChannel,
        message: &BroadcastMessage,
    ) -> DispatchResult<()> {
        let topic = channel.topic();
        let sender = self.sender(&topic).await;
        match sender.send(message.clone()) {
            Ok(receivers) => debug!("广播任务 {} 到 {}，订阅者 {}", message.task_id, topic, receivers),
            Err(_) => debug!("广播任务 {} 到 {}，无订阅者", message.task_id, topic),
        }
        Ok(())
    }
}

#[async_trait]
impl BroadcastSubscriber for InMemoryBroadcastBus {
    async fn subscribe(
        &self,
        channel: &BroadcastChannel,
    ) -> DispatchResult<mpsc::Receiver<BroadcastMessage>> {
        let topic = channel.topic();
        let mut receiver = self.sender(&topic).await.subscribe();
        let (tx, rx) = mpsc::channel(self.capacity);

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("订阅 {} 落后，跳过 {} 条广播", topic, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::models::RoutingClass;

    fn message(task_id: &str) -> BroadcastMessage {
        BroadcastMessage {
            task_id: task_id.to_string(),
            version: "1.0".to_string(),
            tenant_id: "t".to_string(),
            is_async: false,
            pre_assigned_worker_id: None,
            already_tried: vec![],
            broadcast_count: 1,
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InMemoryBroadcastBus::default();
        let channel = BroadcastChannel::new("v1", RoutingClass::Legacy);
        bus.publish(&channel, &message("t1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_only_see_their_channel() {
        let bus = InMemoryBroadcastBus::default();
        let legacy = BroadcastChannel::new("v1", RoutingClass::Legacy);
        let next_gen = BroadcastChannel::new("v1", RoutingClass::NextGen);

        let mut legacy_rx = bus.subscribe(&legacy).await.unwrap();
        let mut ng_rx = bus.subscribe(&next_gen).await.unwrap();

        bus.publish(&next_gen, &message("ng-task")).await.unwrap();
        bus.publish(&legacy, &message("legacy-task")).await.unwrap();

        assert_eq!(legacy_rx.recv().await.unwrap().task_id, "legacy-task");
        assert_eq!(ng_rx.recv().await.unwrap().task_id, "ng-task");
    }
}
