use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::models::{Task, TaskStatus};
use dispatch_core::traits::TaskRepository;
use dispatch_core::{DispatchError, DispatchResult};
use tokio::sync::RwLock;

/// 内存任务仓储，所有条件更新都在同一把写锁内完成
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

fn sorted(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    tasks
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn save(&self, task: &Task, initial_status: TaskStatus) -> DispatchResult<Task> {
        let mut stored = task.clone();
        stored.status = initial_status;
        if stored.must_execute_on_worker_id.is_some() {
            stored.next_broadcast_at = None;
        }

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&stored.id) {
            return Err(DispatchError::DuplicateKey(stored.id.clone()));
        }
        tasks.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: &str) -> DispatchResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> DispatchResult<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task) if task.status == from => {
                task.status = to;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_acquirable(
        &self,
        tenant_id: &str,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DispatchResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let candidates = tasks
            .values()
            .filter(|t| {
                t.tenant_id == tenant_id
                    && t.queue == queue
                    && t.status == TaskStatus::Queued
                    && !t.is_assigned()
                    && !t.is_expired(now)
                    && !t.is_pinned_elsewhere(worker_id)
            })
            .cloned()
            .collect();
        Ok(sorted(candidates)
            .into_iter()
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn assign(
        &self,
        id: &str,
        worker_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(id) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Queued
            || task.is_assigned()
            || task.is_pinned_elsewhere(worker_id)
        {
            return Ok(None);
        }

        task.status = TaskStatus::Started;
        task.worker_id = Some(worker_id.to_string());
        task.expires_at = expires_at;
        task.validating_worker_ids.clear();
        task.validation_started_at = None;
        task.next_broadcast_at = None;
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn start_validation(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Queued || task.is_assigned() {
            return Ok(false);
        }

        if !task.is_validating(worker_id) {
            task.validating_worker_ids.push(worker_id.to_string());
        }
        task.validation_started_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn mark_tried(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.mark_tried(worker_id);
                task.updated_at = now;
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_stale_validations(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<Task>> {
        let mut tasks = self.tasks.write().await;
        let mut released = Vec::new();
        for task in tasks.values_mut() {
            let stale = task
                .validation_started_at
                .map(|at| at <= stale_before)
                .unwrap_or(false);
            if task.status != TaskStatus::Queued || task.is_assigned() || !stale {
                continue;
            }

            task.validating_worker_ids.clear();
            task.validation_started_at = None;
            if task.must_execute_on_worker_id.is_none() {
                task.next_broadcast_at = Some(now);
            }
            task.updated_at = now;
            released.push(task.clone());
        }
        Ok(released)
    }

    async fn requeue(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task)
                if task.status == TaskStatus::Started
                    && task.worker_id.as_deref() == Some(worker_id) =>
            {
                task.status = TaskStatus::Queued;
                task.worker_id = None;
                task.mark_tried(worker_id);
                task.next_broadcast_at = Some(now);
                task.updated_at = now;
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task)
                if task.status == TaskStatus::Started
                    && task.worker_id.as_deref() == Some(worker_id) =>
            {
                task.status = to;
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_broadcast(
        &self,
        id: &str,
        next_broadcast_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.broadcast_count += 1;
                task.next_broadcast_at = next_broadcast_at;
                task.updated_at = now;
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn find_due_for_broadcast(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DispatchResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut due: Vec<Task> = tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Queued
                    && !t.is_assigned()
                    && t.must_execute_on_worker_id.is_none()
                    && t.next_broadcast_at.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|t| t.next_broadcast_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn mark_expired(
        &self,
        now: DateTime<Utc>,
        max_broadcast_rounds: i32,
    ) -> DispatchResult<Vec<Task>> {
        let mut tasks = self.tasks.write().await;
        let mut expired = Vec::new();
        for task in tasks.values_mut() {
            let live = matches!(task.status, TaskStatus::Queued | TaskStatus::Started);
            let over_broadcast = task.status == TaskStatus::Queued
                && !task.is_assigned()
                && task.broadcast_count >= max_broadcast_rounds;
            if live && (task.is_expired(now) || over_broadcast) {
                task.status = TaskStatus::Error;
                task.next_broadcast_at = None;
                task.updated_at = now;
                expired.push(task.clone());
            }
        }
        Ok(expired)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> DispatchResult<u64> {
        let mut tasks = self.tasks.write().await;
        let size = tasks.len();
        tasks.retain(|_, t| !(t.status.is_terminal() && t.updated_at < before));
        Ok((size - tasks.len()) as u64)
    }
}
