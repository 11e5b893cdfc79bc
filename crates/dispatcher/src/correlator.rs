//! 任务响应关联
//!
//! - 同步：提交方在阻塞前登记等待项，响应到达时完成对应的 oneshot
//! - 异步：按任务的 `driver_id` 找到回调后端，序列化后交付

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use dispatch_core::models::{Task, TaskResponse};
use dispatch_core::traits::DriverCallback;
use dispatch_core::{DispatchError, DispatchResult};
use metrics::counter;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct Waiter {
    registration: u64,
    sender: oneshot::Sender<TaskResponse>,
}

/// 同步等待表，按任务ID登记
#[derive(Default)]
pub struct SyncWaitTable {
    waiters: Mutex<HashMap<String, Waiter>>,
    next_registration: AtomicU64,
}

impl SyncWaitTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 登记等待项，同一任务重复登记时旧的等待方收到取消
    pub fn register(self: &Arc<Self>, task_id: &str) -> SyncWait {
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(
            task_id.to_string(),
            Waiter {
                registration,
                sender,
            },
        );
        SyncWait {
            task_id: task_id.to_string(),
            registration,
            receiver: Some(receiver),
            table: Arc::clone(self),
        }
    }

    /// 完成等待项；没有等待方时返回 `false`
    pub fn complete(&self, task_id: &str, response: TaskResponse) -> bool {
        let Some(waiter) = self.lock().remove(task_id) else {
            return false;
        };
        waiter.sender.send(response).is_ok()
    }

    pub fn is_waiting(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_registration(&self, task_id: &str, registration: u64) {
        let mut waiters = self.lock();
        if waiters
            .get(task_id)
            .map(|w| w.registration == registration)
            .unwrap_or(false)
        {
            waiters.remove(task_id);
        }
    }
}

/// 一个同步等待，超时或丢弃时自动移除登记
pub struct SyncWait {
    task_id: String,
    registration: u64,
    receiver: Option<oneshot::Receiver<TaskResponse>>,
    table: Arc<SyncWaitTable>,
}

impl SyncWait {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn wait(mut self, timeout: Duration) -> DispatchResult<TaskResponse> {
        let Some(receiver) = self.receiver.take() else {
            return Err(DispatchError::Internal("等待项已被使用".to_string()));
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DispatchError::Internal(format!(
                "任务 {} 的等待被取消",
                self.task_id
            ))),
            Err(_) => Err(DispatchError::Timeout(format!(
                "等待任务 {} 的响应超时（{}ms）",
                self.task_id,
                timeout.as_millis()
            ))),
        }
    }
}

impl Drop for SyncWait {
    fn drop(&mut self) {
        self.table.remove_registration(&self.task_id, self.registration);
    }
}

/// 回调后端注册表
#[derive(Default)]
pub struct DriverCallbackRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn DriverCallback>>>,
}

impl DriverCallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: Arc<dyn DriverCallback>) {
        let driver_id = callback.driver_id().to_string();
        info!("注册响应回调后端: {}", driver_id);
        self.drivers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(driver_id, callback);
    }

    pub fn unregister(&self, driver_id: &str) -> bool {
        self.drivers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(driver_id)
            .is_some()
    }

    pub fn get(&self, driver_id: &str) -> Option<Arc<dyn DriverCallback>> {
        self.drivers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(driver_id)
            .cloned()
    }
}

/// 响应关联器
pub struct ResponseCorrelator {
    waits: Arc<SyncWaitTable>,
    drivers: Arc<DriverCallbackRegistry>,
}

impl ResponseCorrelator {
    pub fn new(waits: Arc<SyncWaitTable>, drivers: Arc<DriverCallbackRegistry>) -> Self {
        Self { waits, drivers }
    }

    pub fn waits(&self) -> &Arc<SyncWaitTable> {
        &self.waits
    }

    pub fn drivers(&self) -> &Arc<DriverCallbackRegistry> {
        &self.drivers
    }

    /// 同步交付；没有等待方（已超时或从未同步等待）时静默丢弃
    pub fn process_response(&self, task_id: &str, response: TaskResponse) -> bool {
        if self.waits.complete(task_id, response) {
            debug!("任务 {} 的响应已交付给同步等待方", task_id);
            true
        } else {
            counter!("dispatch_responses_dropped_total").increment(1);
            debug!("任务 {} 没有同步等待方，丢弃响应", task_id);
            false
        }
    }

    /// 经回调后端交付
    ///
    /// 任务或响应为空时什么都不做；找不到回调后端时记录日志并丢弃。
    pub async fn handle_driver_response(
        &self,
        task: Option<&Task>,
        response: Option<&TaskResponse>,
    ) -> DispatchResult<()> {
        let (Some(task), Some(response)) = (task, response) else {
            return Ok(());
        };

        let driver = task.driver_id.as_deref().and_then(|id| self.drivers.get(id));
        let Some(driver) = driver else {
            counter!("dispatch_responses_dropped_total").increment(1);
            warn!(
                "任务 {} 的回调后端 {:?} 未注册，丢弃响应",
                task.id, task.driver_id
            );
            return Ok(());
        };

        let payload = serde_json::to_vec(response)?;
        if task.is_async() {
            driver.publish_async_task_response(&task.id, payload).await?;
        } else {
            driver.publish_sync_task_response(&task.id, payload).await?;
        }
        debug!("任务 {} 的响应已交给回调后端 {}", task.id, driver.driver_id());
        Ok(())
    }

    /// 按任务的交付方式路由响应
    pub async fn deliver(&self, task: &Task, response: &TaskResponse) -> DispatchResult<()> {
        if task.driver_id.is_some() {
            self.handle_driver_response(Some(task), Some(response)).await
        } else {
            self.process_response(&task.id, response.clone());
            Ok(())
        }
    }
}

impl Default for ResponseCorrelator {
    fn default() -> Self {
        Self::new(
            Arc::new(SyncWaitTable::new()),
            Arc::new(DriverCallbackRegistry::new()),
        )
    }
}
