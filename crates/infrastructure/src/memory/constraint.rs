use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::models::{
    active_permits, Constraint, ConstraintInstance, FifoStrategy, InstanceState, ReleaseEntity,
};
use dispatch_core::traits::ConstraintRepository;
use dispatch_core::{DispatchError, DispatchResult};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct ConstraintState {
    constraints: HashMap<String, Constraint>,
    instances: Vec<ConstraintInstance>,
    next_order: i64,
}

impl ConstraintState {
    fn unit_instances(&self, constraint_id: &str, resource_unit: &str) -> Vec<ConstraintInstance> {
        self.instances
            .iter()
            .filter(|i| i.constraint_id == constraint_id && i.resource_unit == resource_unit)
            .cloned()
            .collect()
    }

    fn constraint(&self, id: &str) -> DispatchResult<&Constraint> {
        self.constraints
            .get(id)
            .ok_or_else(|| DispatchError::constraint_not_found(id))
    }
}

/// 内存约束仓储，整个状态由一把互斥锁保护
#[derive(Debug, Clone, Default)]
pub struct InMemoryConstraintRepository {
    state: Arc<Mutex<ConstraintState>>,
}

impl InMemoryConstraintRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConstraintRepository for InMemoryConstraintRepository {
    async fn insert(&self, constraint: &Constraint) -> DispatchResult<()> {
        let mut state = self.state.lock().await;
        let exists = state
            .constraints
            .values()
            .any(|c| c.tenant_id == constraint.tenant_id && c.name == constraint.name);
        if exists {
            return Err(DispatchError::DuplicateKey(format!(
                "{}/{}",
                constraint.tenant_id, constraint.name
            )));
        }
        state
            .constraints
            .insert(constraint.id.clone(), constraint.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> DispatchResult<Option<Constraint>> {
        Ok(self.state.lock().await.constraints.get(id).cloned())
    }

    async fn find_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> DispatchResult<Option<Constraint>> {
        let state = self.state.lock().await;
        Ok(state
            .constraints
            .values()
            .find(|c| c.tenant_id == tenant_id && c.name == name)
            .cloned())
    }

    async fn update_capacity(
        &self,
        id: &str,
        capacity: i32,
        now: DateTime<Utc>,
    ) -> DispatchResult<Constraint> {
        let mut state = self.state.lock().await;
        state.constraint(id)?;

        let units: BTreeSet<String> = state
            .instances
            .iter()
            .filter(|i| i.constraint_id == id)
            .map(|i| i.resource_unit.clone())
            .collect();
        let in_use = units
            .iter()
            .map(|unit| active_permits(&state.unit_instances(id, unit)))
            .max()
            .unwrap_or(0);

        if capacity < 1 || capacity < in_use {
            return Err(DispatchError::validation_error(format!(
                "容量不能小于当前占用: 新容量 {capacity}，当前占用 {in_use}"
            )));
        }

        let constraint = state
            .constraints
            .get_mut(id)
            .ok_or_else(|| DispatchError::constraint_not_found(id))?;
        constraint.capacity = capacity;
        constraint.updated_at = now;
        Ok(constraint.clone())
    }

    async fn acquire(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        release_entity: &ReleaseEntity,
        permits: i32,
        now: DateTime<Utc>,
    ) -> DispatchResult<ConstraintInstance> {
        let mut state = self.state.lock().await;
        let capacity = state.constraint(constraint_id)?.capacity;
        let instances = state.unit_instances(constraint_id, resource_unit);

        if let Some(existing) = instances
            .iter()
            .find(|i| i.release_entity.id == release_entity.id)
        {
            return Ok(existing.clone());
        }

        if permits < 1 || permits > capacity {
            return Err(DispatchError::validation_error(format!(
                "许可数必须在1到容量{capacity}之间，当前值: {permits}"
            )));
        }

        let (instance_state, acquired_at) = if FifoStrategy::admits(capacity, &instances, permits)
        {
            (InstanceState::Active, Some(now))
        } else {
            (InstanceState::Blocked, None)
        };

        state.next_order += 1;
        let instance = ConstraintInstance {
            id: uuid::Uuid::new_v4().to_string(),
            constraint_id: constraint_id.to_string(),
            resource_unit: resource_unit.to_string(),
            release_entity: release_entity.clone(),
            permits,
            state: instance_state,
            order: state.next_order,
            acquired_at,
            created_at: now,
        };
        state.instances.push(instance.clone());
        Ok(instance)
    }

    async fn release(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        release_entity_id: &str,
    ) -> DispatchResult<Option<ConstraintInstance>> {
        let mut state = self.state.lock().await;
        let position = state.instances.iter().position(|i| {
            i.constraint_id == constraint_id
                && i.resource_unit == resource_unit
                && i.release_entity.id == release_entity_id
        });
        Ok(position.map(|p| state.instances.remove(p)))
    }

    async fn promote(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<ConstraintInstance>> {
        let mut state = self.state.lock().await;
        let capacity = state.constraint(constraint_id)?.capacity;
        let promotable =
            FifoStrategy::promotable(capacity, &state.unit_instances(constraint_id, resource_unit));

        let mut promoted = Vec::with_capacity(promotable.len());
        for instance in state.instances.iter_mut() {
            if promotable.contains(&instance.id) {
                instance.state = InstanceState::Active;
                instance.acquired_at = Some(now);
                promoted.push(instance.clone());
            }
        }
        promoted.sort_by_key(|i| i.order);
        Ok(promoted)
    }

    async fn list_instances(
        &self,
        constraint_id: &str,
        resource_unit: &str,
    ) -> DispatchResult<Vec<ConstraintInstance>> {
        let state = self.state.lock().await;
        let mut instances = state.unit_instances(constraint_id, resource_unit);
        instances.sort_by_key(|i| i.order);
        Ok(instances)
    }

    async fn resource_units(&self, constraint_id: &str) -> DispatchResult<Vec<String>> {
        let state = self.state.lock().await;
        let units: BTreeSet<String> = state
            .instances
            .iter()
            .filter(|i| i.constraint_id == constraint_id)
            .map(|i| i.resource_unit.clone())
            .collect();
        Ok(units.into_iter().collect())
    }

    async fn list_by_state(&self, state: InstanceState) -> DispatchResult<Vec<ConstraintInstance>> {
        let guard = self.state.lock().await;
        let mut instances: Vec<ConstraintInstance> = guard
            .instances
            .iter()
            .filter(|i| i.state == state)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.order);
        Ok(instances)
    }
}
