use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::models::{ConnectionResult, SelectionLog};
use dispatch_core::traits::{ConnectionResultRepository, SelectionLogRepository};
use dispatch_core::{DispatchError, DispatchResult};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct InMemorySelectionLogRepository {
    logs: Arc<RwLock<Vec<SelectionLog>>>,
}

impl InMemorySelectionLogRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SelectionLogRepository for InMemorySelectionLogRepository {
    async fn save(&self, log: &SelectionLog) -> DispatchResult<()> {
        let mut logs = self.logs.write().await;
        if logs.iter().any(|l| l.batch_id == log.batch_id) {
            return Err(DispatchError::DuplicateKey(log.batch_id.clone()));
        }
        logs.push(log.clone());
        Ok(())
    }

    async fn list_by_task(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> DispatchResult<Vec<SelectionLog>> {
        let logs = self.logs.read().await;
        Ok(logs
            .iter()
            .filter(|l| l.tenant_id == tenant_id && l.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn purge_before(&self, before: DateTime<Utc>) -> DispatchResult<u64> {
        let mut logs = self.logs.write().await;
        let size = logs.len();
        logs.retain(|l| l.sealed_at >= before);
        Ok((size - logs.len()) as u64)
    }
}

type ResultKey = (String, String, String);

#[derive(Debug, Clone, Default)]
pub struct InMemoryConnectionResultRepository {
    results: Arc<RwLock<HashMap<ResultKey, ConnectionResult>>>,
}

impl InMemoryConnectionResultRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionResultRepository for InMemoryConnectionResultRepository {
    async fn upsert_all(&self, results: &[ConnectionResult]) -> DispatchResult<()> {
        let mut stored = self.results.write().await;
        for result in results {
            stored.insert(
                (
                    result.tenant_id.clone(),
                    result.worker_id.clone(),
                    result.criteria.clone(),
                ),
                result.clone(),
            );
        }
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: &str,
        worker_id: &str,
        criteria: &[String],
    ) -> DispatchResult<Vec<ConnectionResult>> {
        let stored = self.results.read().await;
        Ok(criteria
            .iter()
            .filter_map(|c| {
                stored
                    .get(&(tenant_id.to_string(), worker_id.to_string(), c.clone()))
                    .cloned()
            })
            .collect())
    }
}
