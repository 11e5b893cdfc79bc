use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dispatch_core::config::AdmissionConfig;
use dispatch_core::models::{Constraint, ConstraintInstance, InstanceState, ReleaseEntity};
use dispatch_core::traits::{ConstraintRepository, ReleaseEntityStatusLookup};
use dispatch_core::{DispatchError, DispatchResult, FeatureFlag, FeatureFlagProvider};
use metrics::counter;
use tracing::{debug, info, warn};

/// 容量准入控制
///
/// 与任务分发相互独立：按命名约束和资源单元排队发放许可，
/// 容量释放时严格按到达顺序提升。
pub struct AdmissionController {
    constraints: Arc<dyn ConstraintRepository>,
    lookup: Arc<dyn ReleaseEntityStatusLookup>,
    flags: Arc<dyn FeatureFlagProvider>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(
        constraints: Arc<dyn ConstraintRepository>,
        lookup: Arc<dyn ReleaseEntityStatusLookup>,
        flags: Arc<dyn FeatureFlagProvider>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            constraints,
            lookup,
            flags,
            config,
        }
    }

    /// 幂等的获取或创建；并发创建落败时重新读取已有记录
    pub async fn ensure(&self, tenant_id: &str, name: &str) -> DispatchResult<Constraint> {
        if tenant_id.trim().is_empty() || name.trim().is_empty() {
            return Err(DispatchError::validation_error("tenant_id与name不能为空"));
        }
        if let Some(existing) = self.constraints.find_by_name(tenant_id, name).await? {
            return Ok(existing);
        }

        let constraint = Constraint::new(tenant_id, name, self.config.default_capacity);
        match self.constraints.insert(&constraint).await {
            Ok(()) => {
                info!(
                    "创建容量约束 {}/{}，容量 {}",
                    tenant_id, name, constraint.capacity
                );
                Ok(constraint)
            }
            Err(e) if e.is_race_loss() => {
                debug!("容量约束 {}/{} 已被并发创建，重新读取", tenant_id, name);
                self.constraints
                    .find_by_name(tenant_id, name)
                    .await?
                    .ok_or_else(|| DispatchError::constraint_not_found(name))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, constraint_id: &str) -> DispatchResult<Constraint> {
        self.constraints
            .get(constraint_id)
            .await?
            .ok_or_else(|| DispatchError::constraint_not_found(constraint_id))
    }

    /// 申请许可，容量不足或前面有人排队时进入BLOCKED
    pub async fn acquire(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        release_entity: &ReleaseEntity,
        permits: i32,
    ) -> DispatchResult<ConstraintInstance> {
        let instance = self
            .constraints
            .acquire(constraint_id, resource_unit, release_entity, permits, Utc::now())
            .await?;
        debug!(
            "执行实体 {} 申请 {}/{} 的 {} 个许可: {}",
            release_entity.id,
            constraint_id,
            resource_unit,
            permits,
            instance.state.as_str()
        );
        Ok(instance)
    }

    /// 释放许可并按FIFO提升排队者，返回被提升的实例
    pub async fn release(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        release_entity_id: &str,
    ) -> DispatchResult<Vec<ConstraintInstance>> {
        let released = self
            .constraints
            .release(constraint_id, resource_unit, release_entity_id)
            .await?;
        if released.is_none() {
            debug!(
                "执行实体 {} 在 {}/{} 上没有许可",
                release_entity_id, constraint_id, resource_unit
            );
        }
        self.promote(constraint_id, resource_unit).await
    }

    async fn promote(
        &self,
        constraint_id: &str,
        resource_unit: &str,
    ) -> DispatchResult<Vec<ConstraintInstance>> {
        let promoted = self
            .constraints
            .promote(constraint_id, resource_unit, Utc::now())
            .await?;
        if !promoted.is_empty() {
            counter!("dispatch_constraint_promotions_total").increment(promoted.len() as u64);
            info!(
                "{}/{} 提升了 {} 个排队实例",
                constraint_id,
                resource_unit,
                promoted.len()
            );
        }
        Ok(promoted)
    }

    /// 修改容量；不能低于任一资源单元当前ACTIVE许可总数。扩容后立即提升排队者。
    pub async fn update_capacity(
        &self,
        constraint_id: &str,
        capacity: i32,
    ) -> DispatchResult<Constraint> {
        let updated = self
            .constraints
            .update_capacity(constraint_id, capacity, Utc::now())
            .await?;
        for unit in self.constraints.resource_units(constraint_id).await? {
            self.promote(constraint_id, &unit).await?;
        }
        Ok(updated)
    }

    pub async fn instances(
        &self,
        constraint_id: &str,
        resource_unit: &str,
    ) -> DispatchResult<Vec<ConstraintInstance>> {
        self.constraints
            .list_instances(constraint_id, resource_unit)
            .await
    }

    /// 回收执行实体已结束的实例，受开关控制，返回回收数量
    pub async fn gc_sweep(&self, now: DateTime<Utc>) -> DispatchResult<usize> {
        let mut instances = self.constraints.list_by_state(InstanceState::Active).await?;
        instances.extend(self.constraints.list_by_state(InstanceState::Blocked).await?);
        if instances.is_empty() {
            return Ok(0);
        }

        let mut tenants: HashMap<String, Option<String>> = HashMap::new();
        let mut touched: Vec<(String, String)> = Vec::new();
        let mut reclaimed = 0;

        for instance in instances {
            let tenant = match tenants.get(&instance.constraint_id) {
                Some(tenant) => tenant.clone(),
                None => {
                    let tenant = self
                        .constraints
                        .get(&instance.constraint_id)
                        .await?
                        .map(|c| c.tenant_id);
                    tenants.insert(instance.constraint_id.clone(), tenant.clone());
                    tenant
                }
            };
            let Some(tenant) = tenant else {
                continue;
            };
            if !self
                .flags
                .is_enabled(FeatureFlag::ConstraintGarbageCollection, &tenant)
                .await
            {
                continue;
            }

            match self.lookup.is_terminal(&instance.release_entity).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(
                        "查询执行实体 {} 状态失败: {}",
                        instance.release_entity.id, e
                    );
                    continue;
                }
            }

            if self
                .constraints
                .release(
                    &instance.constraint_id,
                    &instance.resource_unit,
                    &instance.release_entity.id,
                )
                .await?
                .is_some()
            {
                reclaimed += 1;
                info!(
                    "执行实体 {}:{} 已结束，回收其在 {}/{} 的 {} 实例",
                    instance.release_entity.entity_type,
                    instance.release_entity.id,
                    instance.constraint_id,
                    instance.resource_unit,
                    instance.state.as_str()
                );
                let key = (instance.constraint_id.clone(), instance.resource_unit.clone());
                if !touched.contains(&key) {
                    touched.push(key);
                }
            }
        }

        for (constraint_id, resource_unit) in touched {
            self.promote(&constraint_id, &resource_unit).await?;
        }
        if reclaimed > 0 {
            debug!("容量约束清理完成于 {}，回收 {} 个实例", now, reclaimed);
        }
        Ok(reclaimed)
    }
}
