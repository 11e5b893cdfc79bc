use std::sync::Arc;
use std::time::Duration;

use dispatch_core::config::DispatcherConfig;
use dispatch_core::models::{Task, TaskResponse, TaskStatus};
use dispatch_core::traits::{ConnectionResultRepository, TaskRepository};
use dispatch_core::{DecisionContext, DispatchError, DispatchResult, FeatureFlagProvider};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastDispatcher;
use crate::correlator::ResponseCorrelator;
use crate::eligibility::{load_history, select_candidate, Candidate, CapabilityProbe};
use crate::identity::WorkerIdentityReconciler;
use crate::selection_log::SelectionAuditLog;

/// 任务提交服务
pub struct TaskSubmissionService {
    tasks: Arc<dyn TaskRepository>,
    results: Arc<dyn ConnectionResultRepository>,
    identity: Arc<WorkerIdentityReconciler>,
    broadcaster: Arc<BroadcastDispatcher>,
    audit: Arc<SelectionAuditLog>,
    correlator: Arc<ResponseCorrelator>,
    flags: Arc<dyn FeatureFlagProvider>,
    probe: Arc<dyn CapabilityProbe>,
    config: DispatcherConfig,
}

impl TaskSubmissionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        results: Arc<dyn ConnectionResultRepository>,
        identity: Arc<WorkerIdentityReconciler>,
        broadcaster: Arc<BroadcastDispatcher>,
        audit: Arc<SelectionAuditLog>,
        correlator: Arc<ResponseCorrelator>,
        flags: Arc<dyn FeatureFlagProvider>,
        probe: Arc<dyn CapabilityProbe>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            tasks,
            results,
            identity,
            broadcaster,
            audit,
            correlator,
            flags,
            probe,
            config,
        }
    }

    /// 提交任务，返回任务ID
    ///
    /// 非点对点任务先挑选首轮广播的预分配Worker，保存为QUEUED后立即广播。
    pub async fn submit(&self, mut task: Task) -> DispatchResult<String> {
        task.validate()?;
        if task.version.is_empty() {
            task.version = self.config.protocol_version.clone();
        }

        if task.must_execute_on_worker_id.is_some() {
            let saved = self.tasks.save(&task, TaskStatus::Queued).await?;
            counter!("dispatch_tasks_submitted_total").increment(1);
            info!(
                "点对点任务 {} 已保存，只由 {:?} 执行",
                saved.id, saved.must_execute_on_worker_id
            );
            return Ok(saved.id);
        }

        if task.pre_assigned_worker_id.is_none() {
            task.pre_assigned_worker_id = self.pick_pre_assigned(&task).await?;
        }

        let saved = self.tasks.save(&task, TaskStatus::Queued).await?;
        counter!("dispatch_tasks_submitted_total").increment(1);
        info!(
            "任务 {} 已提交（类型 {}，预分配 {:?}）",
            saved.id, saved.data.task_type, saved.pre_assigned_worker_id
        );

        if let Err(e) = self.broadcaster.rebroadcast(Some(&saved)).await {
            warn!("任务 {} 首次广播失败，等待重新广播: {}", saved.id, e);
        }
        Ok(saved.id)
    }

    async fn pick_pre_assigned(&self, task: &Task) -> DispatchResult<Option<String>> {
        let workers = self.identity.connected_workers(&task.tenant_id).await?;
        if workers.is_empty() {
            debug!("租户 {} 没有在线Worker，任务 {} 等待轮询", task.tenant_id, task.id);
            return Ok(None);
        }

        let mut candidates = Vec::with_capacity(workers.len());
        for worker in workers {
            let history = load_history(self.results.as_ref(), task, &worker.id).await?;
            candidates.push(Candidate { worker, history });
        }

        let ctx = DecisionContext::resolve(self.flags.as_ref(), &self.config, &task.tenant_id).await;
        let mut batch = self.audit.begin(task);
        let selected = select_candidate(task, &candidates, &ctx, self.probe.as_ref(), &mut batch)
            .await?
            .map(|w| w.id);
        self.audit.seal_quietly(batch).await;
        Ok(selected)
    }

    /// 同步执行：先登记等待项再提交，阻塞到响应到达或任务超时
    pub async fn execute(&self, task: Task) -> DispatchResult<TaskResponse> {
        if task.is_async() {
            return Err(DispatchError::validation_error("异步任务不能同步执行"));
        }
        if task.driver_id.is_some() {
            return Err(DispatchError::validation_error(
                "带回调后端的任务不能在本地同步等待",
            ));
        }

        let timeout_ms = if task.data.timeout_ms > 0 {
            task.data.timeout_ms
        } else {
            self.config.default_sync_timeout_ms
        };
        let wait = self.correlator.waits().register(&task.id);
        self.submit(task).await?;
        wait.wait(Duration::from_millis(timeout_ms as u64)).await
    }

    pub async fn get(&self, task_id: &str) -> DispatchResult<Task> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| DispatchError::task_not_found(task_id))
    }

    /// 取消仍在排队的任务
    pub async fn abort(&self, task_id: &str) -> DispatchResult<bool> {
        let task = self.get(task_id).await?;
        let aborted = self
            .tasks
            .update_status(task_id, TaskStatus::Queued, TaskStatus::Aborted)
            .await?;
        if aborted {
            info!("任务 {} 已取消", task_id);
            let response = TaskResponse::failed(task_id, "任务已取消");
            if let Err(e) = self.correlator.deliver(&task, &response).await {
                warn!("交付任务 {} 的取消响应失败: {}", task_id, e);
            }
        }
        Ok(aborted)
    }
}
