use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dispatch_core::config::DispatcherConfig;
use dispatch_core::models::{BroadcastChannel, BroadcastMessage, Task};
use dispatch_core::traits::{BroadcastPublisher, TaskRepository};
use dispatch_core::DispatchResult;
use metrics::counter;
use rand::Rng;
use tracing::{debug, info, warn};

/// 第 `round` 次广播之后到下一次广播的延迟
///
/// 以广播间隔为基数指数退避，封顶后叠加随机抖动。
pub fn next_broadcast_delay(config: &DispatcherConfig, round: i32) -> Duration {
    let base = config.broadcast_interval_seconds as f64;
    let max = config.broadcast_backoff_max_seconds as f64;
    let exponent = (round.max(1) - 1).min(30);
    let delay = (base * 2f64.powi(exponent)).min(max);

    let jitter = if config.broadcast_jitter_factor > 0.0 {
        let range = delay * config.broadcast_jitter_factor;
        rand::rng().random_range(-range..=range)
    } else {
        0.0
    };

    Duration::milliseconds(((delay + jitter).max(0.0) * 1000.0) as i64)
}

/// 广播分发器
///
/// 把任务通知推到 `(protocol_version, routing_class)` 对应的通道。
/// 每次广播都累加任务的广播次数并安排下一次重新广播。
pub struct BroadcastDispatcher {
    tasks: Arc<dyn TaskRepository>,
    publisher: Arc<dyn BroadcastPublisher>,
    config: DispatcherConfig,
}

impl BroadcastDispatcher {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        publisher: Arc<dyn BroadcastPublisher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            tasks,
            publisher,
            config,
        }
    }

    pub fn channel_for(&self, task: &Task) -> BroadcastChannel {
        BroadcastChannel::for_task(&self.config.protocol_version, task)
    }

    /// 重新广播任务，任务为空时什么都不做
    ///
    /// 返回记录了本次广播的任务；任务已不在排队状态时返回 `None`。
    /// 发布失败只记录日志，任务仍可被轮询领取，且已安排下一次广播。
    pub async fn rebroadcast(&self, task: Option<&Task>) -> DispatchResult<Option<Task>> {
        let Some(task) = task else {
            return Ok(None);
        };
        if task.must_execute_on_worker_id.is_some() {
            debug!("任务 {} 为点对点任务，不广播", task.id);
            return Ok(None);
        }

        let now = Utc::now();
        let next_at = now + next_broadcast_delay(&self.config, task.broadcast_count + 1);
        let Some(updated) = self.tasks.record_broadcast(&task.id, Some(next_at), now).await? else {
            debug!("任务 {} 已不在排队状态，跳过广播", task.id);
            return Ok(None);
        };

        let channel = self.channel_for(&updated);
        let message = BroadcastMessage::from_task(&updated);
        match self.publisher.publish(&channel, &message).await {
            Ok(()) => {
                counter!("dispatch_broadcasts_total").increment(1);
                debug!(
                    "广播任务 {} 到 {}（第 {} 次，已尝试 {:?}）",
                    updated.id,
                    channel.topic(),
                    updated.broadcast_count,
                    updated.already_tried
                );
            }
            Err(e) => {
                counter!("dispatch_broadcast_failures_total").increment(1);
                warn!("广播任务 {} 失败: {}", updated.id, e);
            }
        }
        Ok(Some(updated))
    }

    /// 重新广播所有到期的任务
    pub async fn rebroadcast_due(&self, now: DateTime<Utc>) -> DispatchResult<usize> {
        let due = self
            .tasks
            .find_due_for_broadcast(now, self.config.acquire_batch_size)
            .await?;

        let mut count = 0;
        for task in &due {
            match self.rebroadcast(Some(task)).await {
                Ok(Some(_)) => count += 1,
                Ok(None) => {}
                Err(e) => warn!("重新广播任务 {} 失败: {}", task.id, e),
            }
        }
        if count > 0 {
            info!("重新广播了 {} 个任务", count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            broadcast_interval_seconds: 5,
            broadcast_backoff_max_seconds: 60,
            broadcast_jitter_factor: 0.0,
            ..DispatcherConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let config = config();
        assert_eq!(next_broadcast_delay(&config, 1), Duration::seconds(5));
        assert_eq!(next_broadcast_delay(&config, 2), Duration::seconds(10));
        assert_eq!(next_broadcast_delay(&config, 4), Duration::seconds(40));
        assert_eq!(next_broadcast_delay(&config, 5), Duration::seconds(60));
        assert_eq!(next_broadcast_delay(&config, 500), Duration::seconds(60));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let config = DispatcherConfig {
            broadcast_jitter_factor: 0.1,
            ..config()
        };
        for _ in 0..100 {
            let delay = next_broadcast_delay(&config, 2);
            assert!(delay >= Duration::seconds(9) && delay <= Duration::seconds(11));
        }
    }
}
