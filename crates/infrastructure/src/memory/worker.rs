use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::models::{Connection, SequenceIdentity, Worker};
use dispatch_core::traits::{ConnectionRepository, SequenceRepository, WorkerRepository};
use dispatch_core::{DispatchError, DispatchResult};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkerRepository {
    workers: Arc<RwLock<HashMap<String, Worker>>>,
}

impl InMemoryWorkerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRepository for InMemoryWorkerRepository {
    async fn upsert(&self, worker: &Worker) -> DispatchResult<Worker> {
        let mut workers = self.workers.write().await;
        let stored = match workers.get(&worker.id) {
            Some(existing) => Worker {
                registered_at: existing.registered_at,
                tenant_id: existing.tenant_id.clone(),
                ..worker.clone()
            },
            None => worker.clone(),
        };
        workers.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: &str) -> DispatchResult<Option<Worker>> {
        Ok(self.workers.read().await.get(id).cloned())
    }

    async fn find_by_hostname(
        &self,
        tenant_id: &str,
        hostname: &str,
    ) -> DispatchResult<Option<Worker>> {
        let workers = self.workers.read().await;
        Ok(workers
            .values()
            .filter(|w| w.tenant_id == tenant_id && w.hostname == hostname)
            .min_by_key(|w| w.registered_at)
            .cloned())
    }

    async fn delete(&self, id: &str) -> DispatchResult<bool> {
        Ok(self.workers.write().await.remove(id).is_some())
    }

    async fn list_enabled(&self, tenant_id: &str) -> DispatchResult<Vec<Worker>> {
        let workers = self.workers.read().await;
        let mut enabled: Vec<Worker> = workers
            .values()
            .filter(|w| w.tenant_id == tenant_id && w.is_enabled())
            .cloned()
            .collect();
        enabled.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(enabled)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryConnectionRepository {
    connections: Arc<RwLock<HashMap<String, Connection>>>,
}

impl InMemoryConnectionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionRepository for InMemoryConnectionRepository {
    async fn heartbeat(&self, connection: &Connection) -> DispatchResult<()> {
        let mut stored = connection.clone();
        stored.disconnected = false;
        self.connections
            .write()
            .await
            .insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn connected_worker_ids(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> DispatchResult<Vec<String>> {
        let connections = self.connections.read().await;
        let ids: BTreeSet<String> = connections
            .values()
            .filter(|c| c.tenant_id == tenant_id && !c.disconnected && c.last_heartbeat >= since)
            .map(|c| c.worker_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn disconnect_stale(&self, before: DateTime<Utc>) -> DispatchResult<u64> {
        let mut connections = self.connections.write().await;
        let mut count = 0;
        for connection in connections.values_mut() {
            if !connection.disconnected && connection.last_heartbeat < before {
                connection.disconnected = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn disconnect(&self, connection_id: &str) -> DispatchResult<bool> {
        let mut connections = self.connections.write().await;
        match connections.get_mut(connection_id) {
            Some(connection) => {
                connection.disconnected = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySequenceRepository {
    identities: Arc<RwLock<Vec<SequenceIdentity>>>,
}

impl InMemorySequenceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceRepository for InMemorySequenceRepository {
    async fn get(
        &self,
        tenant_id: &str,
        hostname_prefix: &str,
        sequence_number: i32,
    ) -> DispatchResult<Option<SequenceIdentity>> {
        let identities = self.identities.read().await;
        Ok(identities
            .iter()
            .find(|i| {
                i.tenant_id == tenant_id
                    && i.hostname_prefix == hostname_prefix
                    && i.sequence_number == sequence_number
            })
            .cloned())
    }

    async fn list(
        &self,
        tenant_id: &str,
        hostname_prefix: &str,
    ) -> DispatchResult<Vec<SequenceIdentity>> {
        let identities = self.identities.read().await;
        let mut matching: Vec<SequenceIdentity> = identities
            .iter()
            .filter(|i| i.tenant_id == tenant_id && i.hostname_prefix == hostname_prefix)
            .cloned()
            .collect();
        matching.sort_by_key(|i| i.sequence_number);
        Ok(matching)
    }

    async fn insert(&self, identity: &SequenceIdentity) -> DispatchResult<()> {
        let mut identities = self.identities.write().await;
        let taken = identities.iter().any(|i| {
            i.tenant_id == identity.tenant_id
                && i.hostname_prefix == identity.hostname_prefix
                && i.sequence_number == identity.sequence_number
        });
        if taken {
            return Err(DispatchError::DuplicateKey(format!(
                "{}/{}",
                identity.hostname_prefix, identity.sequence_number
            )));
        }
        identities.push(identity.clone());
        Ok(())
    }

    async fn rebind_if_stale(
        &self,
        id: &str,
        new_token: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let mut identities = self.identities.write().await;
        match identities.iter_mut().find(|i| i.id == id) {
            Some(identity) if identity.last_updated_at < stale_before => {
                identity.token = new_token.to_string();
                identity.last_updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch(
        &self,
        tenant_id: &str,
        hostname_prefix: &str,
        sequence_number: i32,
        token: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let mut identities = self.identities.write().await;
        let found = identities.iter_mut().find(|i| {
            i.tenant_id == tenant_id
                && i.hostname_prefix == hostname_prefix
                && i.sequence_number == sequence_number
                && i.token == token
        });
        match found {
            Some(identity) => {
                identity.last_updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
