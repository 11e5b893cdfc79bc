use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dispatch_core::config::{AdmissionConfig, DispatcherConfig};
use dispatch_core::models::TaskResponse;
use dispatch_core::traits::TaskRepository;
use dispatch_core::DispatchResult;
use metrics::counter;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::broadcast::BroadcastDispatcher;
use crate::correlator::ResponseCorrelator;
use crate::identity::WorkerIdentityReconciler;
use crate::selection_log::SelectionAuditLog;

/// 一轮维护的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub validations_released: usize,
    pub rebroadcast: usize,
    pub disconnected: u64,
    pub constraints_reclaimed: usize,
    pub purged: u64,
    pub selection_logs_purged: u64,
}

/// 周期性维护：回收过期任务，释放超时验证并重新广播，断开超时会话，
/// 清理约束实例，删除过期的终态任务和选择记录
pub struct MaintenanceService {
    tasks: Arc<dyn TaskRepository>,
    broadcaster: Arc<BroadcastDispatcher>,
    audit: Arc<SelectionAuditLog>,
    correlator: Arc<ResponseCorrelator>,
    identity: Arc<WorkerIdentityReconciler>,
    admission: Arc<AdmissionController>,
    config: DispatcherConfig,
    admission_config: AdmissionConfig,
    running: Arc<RwLock<bool>>,
    last_sweep: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl MaintenanceService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        broadcaster: Arc<BroadcastDispatcher>,
        audit: Arc<SelectionAuditLog>,
        correlator: Arc<ResponseCorrelator>,
        identity: Arc<WorkerIdentityReconciler>,
        admission: Arc<AdmissionController>,
        config: DispatcherConfig,
        admission_config: AdmissionConfig,
    ) -> Self {
        Self {
            tasks,
            broadcaster,
            audit,
            correlator,
            identity,
            admission,
            config,
            admission_config,
            running: Arc::new(RwLock::new(false)),
            last_sweep: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// 运行维护循环，直到 `stop` 或收到关闭信号
    pub async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> DispatchResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("维护循环已在运行");
                return Ok(());
            }
            *running = true;
        }
        info!("启动分发维护循环");

        let interval = Duration::from_secs(self.config.maintenance_interval_seconds);
        loop {
            if !self.is_running().await {
                break;
            }

            if let Err(e) = self.run_once(Utc::now()).await {
                error!("分发维护出错: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.recv() => {
                    info!("收到关闭信号，退出分发维护循环");
                    break;
                }
            }
        }

        *self.running.write().await = false;
        Ok(())
    }

    pub async fn stop(&self) {
        info!("停止分发维护循环");
        *self.running.write().await = false;
    }

    /// 执行一轮维护
    pub async fn run_once(&self, now: DateTime<Utc>) -> DispatchResult<MaintenanceReport> {
        let mut report = MaintenanceReport {
            expired: self.reap_expired(now).await?,
            ..MaintenanceReport::default()
        };

        report.validations_released = self.release_stale_validations(now).await?;
        report.rebroadcast = self.broadcaster.rebroadcast_due(now).await?;
        report.disconnected = self.identity.disconnect_stale(now).await?;

        if self.sweep_due(now).await {
            match self.admission.gc_sweep(now).await {
                Ok(count) => report.constraints_reclaimed = count,
                Err(e) => warn!("容量约束清理失败: {}", e),
            }
        }

        let retention = chrono::Duration::hours(self.config.retention_hours);
        report.purged = self.tasks.purge_terminal(now - retention).await?;
        if report.purged > 0 {
            info!("删除了 {} 个过期终态任务", report.purged);
        }
        report.selection_logs_purged = self.audit.purge_before(now - retention).await?;

        debug!("本轮维护: {:?}", report);
        Ok(report)
    }

    async fn sweep_due(&self, now: DateTime<Utc>) -> bool {
        let mut last = self.last_sweep.write().await;
        let interval = chrono::Duration::seconds(self.admission_config.sweep_interval_seconds as i64);
        match *last {
            Some(at) if now - at < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Worker开始验证后一直没有回报，视同放弃：清空验证集合，任务等待重新广播
    async fn release_stale_validations(&self, now: DateTime<Utc>) -> DispatchResult<usize> {
        let stale_before = now - chrono::Duration::seconds(self.config.validation_timeout_seconds);
        let released = self.tasks.release_stale_validations(stale_before, now).await?;
        for task in &released {
            counter!("dispatch_validations_timed_out_total").increment(1);
            warn!("任务 {} 的能力验证超时未回报，重新等待领取", task.id);
        }
        Ok(released.len())
    }

    /// 回收过期任务，并通知等待方
    async fn reap_expired(&self, now: DateTime<Utc>) -> DispatchResult<usize> {
        let expired = self
            .tasks
            .mark_expired(now, self.config.max_broadcast_rounds)
            .await?;

        for task in &expired {
            counter!("dispatch_tasks_expired_total").increment(1);
            let reason = if task.is_expired(now) {
                "任务执行超时"
            } else {
                "任务广播次数超过上限仍未被领取"
            };
            warn!("任务 {} 已回收: {}", task.id, reason);

            let response = TaskResponse::expired(&task.id, reason);
            if let Err(e) = self.correlator.deliver(task, &response).await {
                warn!("通知任务 {} 过期失败: {}", task.id, e);
            }
        }
        Ok(expired.len())
    }
}
