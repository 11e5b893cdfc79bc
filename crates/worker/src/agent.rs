use std::sync::Arc;
use std::time::Duration;

use dispatch_core::config::WorkerConfig;
use dispatch_core::models::{HeartbeatRequest, Task, TaskPackage, Worker};
use dispatch_core::{DispatchError, DispatchResult};
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::client::DispatcherClient;
use crate::executors::{ExecutionOutcome, ExecutorRegistry};
use crate::identity::{IdentityStore, WorkerIdentity};
use crate::probe::validate_all;

/// 一轮拉取的结果
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// 没有可领取的任务
    Idle,
    /// 验证未通过，任务留给其他Worker
    ValidationFailed(String),
    /// 不支持的任务类型，已拒绝
    Declined(String),
    /// 已执行并回传结果
    Executed { task_id: String, success: bool },
}

/// Worker代理：心跳、拉取、验证、执行、回传
pub struct WorkerAgent {
    config: WorkerConfig,
    client: DispatcherClient,
    store: IdentityStore,
    executors: ExecutorRegistry,
    identity: RwLock<WorkerIdentity>,
    hostname_prefix: String,
    is_running: Arc<RwLock<bool>>,
}

impl WorkerAgent {
    /// 读取（或生成）身份文件并创建代理
    pub async fn new(config: WorkerConfig, executors: ExecutorRegistry) -> DispatchResult<Self> {
        let client = DispatcherClient::new(config.dispatcher_url.clone());
        let store = IdentityStore::new(config.identity_file.clone());
        let identity = store.load_or_create().await?;
        let hostname_prefix = if config.hostname_prefix.trim().is_empty() {
            local_hostname()
        } else {
            config.hostname_prefix.clone()
        };

        Ok(Self {
            config,
            client,
            store,
            executors,
            identity: RwLock::new(identity),
            hostname_prefix,
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    pub async fn identity(&self) -> WorkerIdentity {
        self.identity.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    async fn heartbeat_request(&self) -> HeartbeatRequest {
        let identity = self.identity.read().await;
        HeartbeatRequest {
            tenant_id: self.config.tenant_id.clone(),
            hostname_prefix: self.hostname_prefix.clone(),
            sequence_number: identity.sequence_number,
            token: Some(identity.token.clone()),
            worker_id: identity.worker_id.clone(),
            connection_id: None,
            ip_address: local_ip(),
            tags: self.config.tags.clone(),
            scopes: Default::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// 发送心跳，并把服务端解析出的身份写回文件
    pub async fn heartbeat(&self) -> DispatchResult<Worker> {
        let request = self.heartbeat_request().await;
        let worker = self.client.heartbeat(&request).await?;

        let mut identity = self.identity.write().await;
        if identity.update_from(&worker) {
            self.store.save(&identity).await?;
            info!(
                "Worker身份更新: id={}, hostname={}, sequence={:?}",
                worker.id, worker.hostname, worker.sequence_number
            );
        }
        Ok(worker)
    }

    async fn worker_id(&self) -> DispatchResult<String> {
        self.identity
            .read()
            .await
            .worker_id
            .clone()
            .ok_or_else(|| DispatchError::Internal("Worker尚未注册".to_string()))
    }

    /// 拉取并处理一个任务
    pub async fn poll_once(&self) -> DispatchResult<PollOutcome> {
        let worker_id = self.worker_id().await?;
        let tenant_id = &self.config.tenant_id;

        let Some(package) = self
            .client
            .acquire(tenant_id, &worker_id, &self.config.queue)
            .await?
        else {
            return Ok(PollOutcome::Idle);
        };

        let package = if package.validation_required {
            let task_id = package.task.id.clone();
            let (passed, assigned) = self.validate(&worker_id, &package.task).await?;
            match assigned {
                Some(package) => package,
                None if passed => return Ok(PollOutcome::Idle),
                None => return Ok(PollOutcome::ValidationFailed(task_id)),
            }
        } else {
            package
        };

        self.execute(&worker_id, package.task).await
    }

    /// 验证能力条件并回报，返回是否全部通过以及服务端分配的任务包
    async fn validate(
        &self,
        worker_id: &str,
        task: &Task,
    ) -> DispatchResult<(bool, Option<TaskPackage>)> {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let checks = validate_all(&task.signature(), timeout).await;
        let passed = checks.iter().all(|c| c.validated);
        debug!(
            "任务 {} 的能力验证结果: {}/{} 通过",
            task.id,
            checks.iter().filter(|c| c.validated).count(),
            checks.len()
        );

        let assigned = self
            .client
            .report_validation(&self.config.tenant_id, worker_id, &task.id, &checks)
            .await?;
        if !passed {
            warn!("任务 {} 的能力验证未通过，交给其他Worker", task.id);
        } else if assigned.is_none() {
            debug!("任务 {} 验证通过但已被其他Worker领取", task.id);
        }
        Ok((passed, assigned))
    }

    async fn execute(&self, worker_id: &str, task: Task) -> DispatchResult<PollOutcome> {
        let tenant_id = &self.config.tenant_id;
        let Some(executor) = self.executors.get(&task.data.task_type) else {
            warn!("不支持的任务类型 {}，拒绝任务 {}", task.data.task_type, task.id);
            self.client.decline(tenant_id, worker_id, &task.id).await?;
            return Ok(PollOutcome::Declined(task.id));
        };

        let timeout = Duration::from_millis(task.data.timeout_ms.max(1) as u64);
        let outcome = match tokio::time::timeout(timeout, executor.execute(&task)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!("任务 {} 执行出错: {}", task.id, e);
                ExecutionOutcome::failure(e.to_string())
            }
            Err(_) => {
                error!("任务 {} 执行超时", task.id);
                ExecutionOutcome::failure(format!("执行超时: {}ms", task.data.timeout_ms))
            }
        };

        let success = outcome.success;
        let accepted = self
            .client
            .submit_response(tenant_id, worker_id, &task.id, &outcome.into_result_body())
            .await?;
        if !accepted {
            warn!("任务 {} 的结果未被Dispatcher接受", task.id);
        }
        Ok(PollOutcome::Executed {
            task_id: task.id,
            success,
        })
    }

    /// 运行心跳与拉取循环，直到收到关闭信号
    pub async fn start(&self, mut shutdown_rx: broadcast::Receiver<()>) -> DispatchResult<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Err(DispatchError::Internal("Worker代理已在运行".to_string()));
            }
            *running = true;
        }

        info!(
            "启动Worker代理: tenant={}, prefix={}, queue={}, 执行器={:?}",
            self.config.tenant_id,
            self.hostname_prefix,
            self.config.queue,
            self.executors.supported_task_types()
        );

        let mut heartbeat_interval =
            interval(Duration::from_secs(self.config.heartbeat_interval_seconds));
        let mut poll_interval =
            interval(Duration::from_secs(self.config.task_poll_interval_seconds.max(1)));

        loop {
            tokio::select! {
                _ = heartbeat_interval.tick() => {
                    match self.heartbeat().await {
                        Ok(worker) => debug!("心跳成功: {}", worker.id),
                        Err(DispatchError::InvalidToken(msg)) => {
                            error!("身份令牌被拒绝，请检查身份文件 {}: {}", self.store.path().display(), msg);
                        }
                        Err(e) => warn!("心跳失败: {}", e),
                    }
                }
                _ = poll_interval.tick() => {
                    if self.identity.read().await.worker_id.is_none() {
                        continue;
                    }
                    match self.poll_once().await {
                        Ok(PollOutcome::Idle) => {}
                        Ok(outcome) => debug!("拉取结果: {:?}", outcome),
                        Err(e) => warn!("拉取任务失败: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Worker代理收到关闭信号");
                    break;
                }
            }
        }

        *self.is_running.write().await = false;
        Ok(())
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string())
}

fn local_ip() -> String {
    std::env::var("WORKER_IP").unwrap_or_else(|_| "127.0.0.1".to_string())
}
