use async_trait::async_trait;
use dispatch_core::models::{BroadcastChannel, BroadcastMessage};
use dispatch_core::traits::{BroadcastPublisher, BroadcastSubscriber};
use dispatch_core::{DispatchError, DispatchResult};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Redis发布/订阅广播
#[derive(Clone)]
pub struct RedisBroadcast {
    client: Client,
    connection: ConnectionManager,
    buffer: usize,
}

impl RedisBroadcast {
    pub async fn connect(url: &str, buffer: usize) -> DispatchResult<Self> {
        let client = Client::open(url)
            .map_err(|e| DispatchError::Broadcast(format!("创建Redis客户端失败: {e}")))?;
        let mut connection = client
            .get_connection_manager()
            .await
            .map_err(|e| DispatchError::Broadcast(format!("连接Redis失败: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| DispatchError::Broadcast(format!("Redis PING失败: {e}")))?;

        info!("Redis广播通道已连接");
        Ok(Self {
            client,
            connection,
            buffer: buffer.max(1),
        })
    }
}

#[async_trait]
impl BroadcastPublisher for RedisBroadcast {
    async fn publish(
        &self,
        channel: &BroadcastChannel,
        message: &BroadcastMessage,
    ) -> DispatchResult<()> {
        let payload = serde_json::to_string(message)?;
        let mut connection = self.connection.clone();
        let receivers: i64 = connection
            .publish(channel.topic(), payload)
            .await
            .map_err(|e| DispatchError::Broadcast(format!("发布广播失败: {e}")))?;
        debug!(
            "广播任务 {} 到 {}，订阅者 {}",
            message.task_id,
            channel.topic(),
            receivers
        );
        Ok(())
    }
}

#[async_trait]
impl BroadcastSubscriber for RedisBroadcast {
    async fn subscribe(
        &self,
        channel: &BroadcastChannel,
    ) -> DispatchResult<mpsc::Receiver<BroadcastMessage>> {
        let topic = channel.topic();
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| DispatchError::Broadcast(format!("建立订阅连接失败: {e}")))?;
        pubsub
            .subscribe(&topic)
            .await
            .map_err(|e| DispatchError::Broadcast(format!("订阅 {topic} 失败: {e}")))?;

        let (tx, rx) = mpsc::channel(self.buffer);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("读取广播内容失败: {}", e);
                        continue;
                    }
                };
                match serde_json::from_str::<BroadcastMessage>(&payload) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("解析广播消息失败: {}", e),
                }
            }
            debug!("订阅 {} 结束", topic);
        });

        Ok(rx)
    }
}
