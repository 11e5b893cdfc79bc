use std::sync::Arc;

use chrono::{DateTime, Utc};
use dispatch_core::config::DispatcherConfig;
use dispatch_core::models::{
    deadline_after, CapabilityCheck, ConnectionResult, SelectionOutcome, Task, TaskPackage,
    TaskResponse, Worker,
};
use dispatch_core::traits::{ConnectionResultRepository, TaskRepository, WorkerRepository};
use dispatch_core::{DecisionContext, DispatchError, DispatchResult, FeatureFlagProvider};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastDispatcher;
use crate::correlator::ResponseCorrelator;
use crate::eligibility::{evaluate, load_history, Verdict};
use crate::identity::WorkerIdentityReconciler;
use crate::selection_log::SelectionAuditLog;

/// 面向Worker的任务领取服务
///
/// 分配都通过仓储的条件更新完成：竞争失败直接返回空，由Worker的轮询节奏负责重试。
pub struct AcquisitionService {
    tasks: Arc<dyn TaskRepository>,
    workers: Arc<dyn WorkerRepository>,
    results: Arc<dyn ConnectionResultRepository>,
    identity: Arc<WorkerIdentityReconciler>,
    broadcaster: Arc<BroadcastDispatcher>,
    audit: Arc<SelectionAuditLog>,
    correlator: Arc<ResponseCorrelator>,
    flags: Arc<dyn FeatureFlagProvider>,
    config: DispatcherConfig,
}

impl AcquisitionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        workers: Arc<dyn WorkerRepository>,
        results: Arc<dyn ConnectionResultRepository>,
        identity: Arc<WorkerIdentityReconciler>,
        broadcaster: Arc<BroadcastDispatcher>,
        audit: Arc<SelectionAuditLog>,
        correlator: Arc<ResponseCorrelator>,
        flags: Arc<dyn FeatureFlagProvider>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            tasks,
            workers,
            results,
            identity,
            broadcaster,
            audit,
            correlator,
            flags,
            config,
        }
    }

    async fn load_worker(&self, tenant_id: &str, worker_id: &str) -> DispatchResult<Worker> {
        match self.workers.get(worker_id).await? {
            Some(worker) if worker.tenant_id == tenant_id => Ok(worker),
            _ => Err(DispatchError::worker_not_found(worker_id)),
        }
    }

    async fn load_task(&self, tenant_id: &str, task_id: &str) -> DispatchResult<Task> {
        match self.tasks.get(task_id).await? {
            Some(task) if task.tenant_id == tenant_id => Ok(task),
            _ => Err(DispatchError::task_not_found(task_id)),
        }
    }

    fn execution_deadline(task: &Task, now: DateTime<Utc>) -> DispatchResult<DateTime<Utc>> {
        deadline_after(now, task.data.timeout_ms)
    }

    /// 为轮询的Worker领取下一个任务
    pub async fn acquire(
        &self,
        tenant_id: &str,
        worker_id: &str,
        queue: &str,
    ) -> DispatchResult<Option<TaskPackage>> {
        let worker = self.load_worker(tenant_id, worker_id).await?;
        if !worker.is_enabled() {
            debug!("Worker {} 已禁用，不分配任务", worker_id);
            return Ok(None);
        }
        if !self.identity.is_connected(&worker).await? {
            debug!("Worker {} 未在线，不分配任务", worker_id);
            return Ok(None);
        }

        let ctx = DecisionContext::resolve(self.flags.as_ref(), &self.config, tenant_id).await;
        let candidates = self
            .tasks
            .find_acquirable(tenant_id, queue, worker_id, ctx.now, self.config.acquire_batch_size)
            .await?;

        for task in candidates {
            if task.is_validating(worker_id) {
                continue;
            }

            let history = load_history(self.results.as_ref(), &task, worker_id).await?;
            let mut batch = self.audit.begin(&task);
            let verdict = evaluate(&task, &worker, &history, &ctx, &mut batch);

            let outcome = match verdict {
                Verdict::Reject(_) => None,
                Verdict::Accept(_) => {
                    let deadline = Self::execution_deadline(&task, ctx.now)?;
                    match self.tasks.assign(&task.id, worker_id, deadline, ctx.now).await? {
                        Some(assigned) => {
                            batch.record(worker_id, SelectionOutcome::Selected, "已分配");
                            counter!("dispatch_tasks_acquired_total").increment(1);
                            info!("任务 {} 分配给Worker {}", assigned.id, worker_id);
                            Some(Some(TaskPackage {
                                task: assigned,
                                validation_required: false,
                            }))
                        }
                        None => Some(self.lost_race(&task, worker_id)),
                    }
                }
                Verdict::NeedsValidation => {
                    if self.tasks.start_validation(&task.id, worker_id, ctx.now).await? {
                        let pending = self.load_task(tenant_id, &task.id).await?;
                        info!("任务 {} 等待Worker {} 验证能力条件", task.id, worker_id);
                        Some(Some(TaskPackage {
                            task: pending,
                            validation_required: true,
                        }))
                    } else {
                        Some(self.lost_race(&task, worker_id))
                    }
                }
            };

            self.audit.seal_quietly(batch).await;
            if let Some(package) = outcome {
                return Ok(package);
            }
        }
        Ok(None)
    }

    fn lost_race(&self, task: &Task, worker_id: &str) -> Option<TaskPackage> {
        counter!("dispatch_acquire_races_lost_total").increment(1);
        debug!("Worker {} 领取任务 {} 时竞争失败", worker_id, task.id);
        None
    }

    /// Worker回报能力验证结果
    ///
    /// 全部通过则完成分配；否则把Worker记入已尝试并重新广播。
    pub async fn report_validation(
        &self,
        tenant_id: &str,
        worker_id: &str,
        task_id: &str,
        checks: &[CapabilityCheck],
    ) -> DispatchResult<Option<TaskPackage>> {
        let task = self.load_task(tenant_id, task_id).await?;
        let now = Utc::now();

        let results: Vec<ConnectionResult> = checks
            .iter()
            .map(|check| ConnectionResult {
                tenant_id: tenant_id.to_string(),
                worker_id: worker_id.to_string(),
                criteria: check.criteria.clone(),
                validated: check.validated,
                last_updated_at: now,
            })
            .collect();
        if !results.is_empty() {
            self.results.upsert_all(&results).await?;
        }

        if !task.is_validating(worker_id) {
            debug!("Worker {} 并未在验证任务 {}，忽略结果", worker_id, task_id);
            return Ok(None);
        }

        let failed: Vec<String> = task
            .signature()
            .into_iter()
            .filter(|criteria| {
                !checks
                    .iter()
                    .any(|c| &c.criteria == criteria && c.validated)
            })
            .collect();

        let mut batch = self.audit.begin(&task);
        let package = if failed.is_empty() {
            let deadline = Self::execution_deadline(&task, now)?;
            match self.tasks.assign(task_id, worker_id, deadline, now).await? {
                Some(assigned) => {
                    batch.record(worker_id, SelectionOutcome::Selected, "验证通过，已分配");
                    counter!("dispatch_tasks_acquired_total").increment(1);
                    info!("任务 {} 验证通过，分配给Worker {}", task_id, worker_id);
                    Some(TaskPackage {
                        task: assigned,
                        validation_required: false,
                    })
                }
                None => self.lost_race(&task, worker_id),
            }
        } else {
            batch.reject(worker_id, format!("验证失败: {}", failed.join(", ")));
            warn!("Worker {} 无法满足任务 {} 的条件 {:?}", worker_id, task_id, failed);
            let updated = self.tasks.mark_tried(task_id, worker_id, now).await?;
            self.broadcaster.rebroadcast(updated.as_ref()).await?;
            None
        };
        self.audit.seal_quietly(batch).await;
        Ok(package)
    }

    /// Worker拒绝任务：记入已尝试并重新广播
    pub async fn decline(
        &self,
        tenant_id: &str,
        worker_id: &str,
        task_id: &str,
    ) -> DispatchResult<bool> {
        let task = self.load_task(tenant_id, task_id).await?;
        let now = Utc::now();

        let updated = if task.worker_id.as_deref() == Some(worker_id) {
            self.tasks.requeue(task_id, worker_id, now).await?
        } else {
            self.tasks.mark_tried(task_id, worker_id, now).await?
        };
        let Some(updated) = updated else {
            return Ok(false);
        };

        let mut batch = self.audit.begin(&updated);
        batch.reject(worker_id, "Worker拒绝");
        self.audit.seal_quietly(batch).await;

        info!("Worker {} 拒绝任务 {}，重新广播", worker_id, task_id);
        self.broadcaster.rebroadcast(Some(&updated)).await?;
        Ok(true)
    }

    /// Worker提交执行结果
    ///
    /// 只有持有任务的Worker能把STARTED转为终态；重复或迟到的结果是空操作，返回 `false`。
    pub async fn submit_response(
        &self,
        tenant_id: &str,
        worker_id: &str,
        response: TaskResponse,
    ) -> DispatchResult<bool> {
        let task = self.load_task(tenant_id, &response.task_id).await?;
        let now = Utc::now();

        let Some(status) = response.response_code.terminal_status() else {
            let Some(requeued) = self.tasks.requeue(&task.id, worker_id, now).await? else {
                return Ok(false);
            };
            info!("任务 {} 请求换其他Worker执行，排除 {}", task.id, worker_id);
            self.broadcaster.rebroadcast(Some(&requeued)).await?;
            return Ok(true);
        };

        if !self.tasks.complete(&task.id, worker_id, status, now).await? {
            counter!("dispatch_responses_dropped_total").increment(1);
            debug!(
                "任务 {} 的结果来自非持有者或重复提交（Worker {}），忽略",
                task.id, worker_id
            );
            return Ok(false);
        }

        info!("任务 {} 由Worker {} 完成: {}", task.id, worker_id, status);
        if let Err(e) = self.correlator.deliver(&task, &response).await {
            warn!("交付任务 {} 的结果失败: {}", task.id, e);
        }
        Ok(true)
    }
}
