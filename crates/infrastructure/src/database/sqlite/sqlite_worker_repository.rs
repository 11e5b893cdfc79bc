use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::models::{Connection, Worker, WorkerStatus};
use dispatch_core::traits::{ConnectionRepository, WorkerRepository};
use dispatch_core::{DispatchError, DispatchResult};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

pub struct SqliteWorkerRepository {
    pool: SqlitePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_worker(row: &SqliteRow) -> DispatchResult<Worker> {
        let status: String = row.try_get("status")?;
        let status = WorkerStatus::parse(&status)
            .ok_or_else(|| DispatchError::Serialization(format!("无效的Worker状态: {status}")))?;

        Ok(Worker {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            hostname: row.try_get("hostname")?,
            ip_address: row.try_get("ip_address")?,
            hostname_prefix: row.try_get("hostname_prefix")?,
            sequence_number: row.try_get("sequence_number")?,
            token: row.try_get("token")?,
            tags: MappingHelpers::from_json(&row.try_get::<String, _>("tags")?, "tags")?,
            scopes: MappingHelpers::from_json(&row.try_get::<String, _>("scopes")?, "scopes")?,
            version: row.try_get("version")?,
            status,
            last_heartbeat: MappingHelpers::from_millis(row.try_get("last_heartbeat")?)?,
            registered_at: MappingHelpers::from_millis(row.try_get("registered_at")?)?,
        })
    }
}

#[async_trait]
impl WorkerRepository for SqliteWorkerRepository {
    async fn upsert(&self, worker: &Worker) -> DispatchResult<Worker> {
        sqlx::query(
            r#"
            INSERT INTO workers (
                id, tenant_id, hostname, ip_address, hostname_prefix, sequence_number, token,
                tags, scopes, version, status, last_heartbeat, registered_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                hostname = excluded.hostname,
                ip_address = excluded.ip_address,
                hostname_prefix = excluded.hostname_prefix,
                sequence_number = excluded.sequence_number,
                token = excluded.token,
                tags = excluded.tags,
                scopes = excluded.scopes,
                version = excluded.version,
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.tenant_id)
        .bind(&worker.hostname)
        .bind(&worker.ip_address)
        .bind(&worker.hostname_prefix)
        .bind(worker.sequence_number)
        .bind(&worker.token)
        .bind(MappingHelpers::to_json(&worker.tags)?)
        .bind(MappingHelpers::to_json(&worker.scopes)?)
        .bind(&worker.version)
        .bind(worker.status.as_str())
        .bind(MappingHelpers::to_millis(worker.last_heartbeat))
        .bind(MappingHelpers::to_millis(worker.registered_at))
        .execute(&self.pool)
        .await?;

        debug!("写入Worker: {} ({})", worker.id, worker.hostname);
        self.get(&worker.id)
            .await?
            .ok_or_else(|| DispatchError::worker_not_found(&worker.id))
    }

    async fn get(&self, id: &str) -> DispatchResult<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn find_by_hostname(
        &self,
        tenant_id: &str,
        hostname: &str,
    ) -> DispatchResult<Option<Worker>> {
        let row = sqlx::query(
            "SELECT * FROM workers WHERE tenant_id = ? AND hostname = ? ORDER BY registered_at LIMIT 1",
        )
        .bind(tenant_id)
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn delete(&self, id: &str) -> DispatchResult<bool> {
        let result = sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_enabled(&self, tenant_id: &str) -> DispatchResult<Vec<Worker>> {
        let rows = sqlx::query(
            "SELECT * FROM workers WHERE tenant_id = ? AND status = 'ENABLED' ORDER BY registered_at, id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_worker).collect()
    }
}

pub struct SqliteConnectionRepository {
    pool: SqlitePool,
}

impl SqliteConnectionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConnectionRepository for SqliteConnectionRepository {
    async fn heartbeat(&self, connection: &Connection) -> DispatchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO connections (id, worker_id, tenant_id, version, last_heartbeat, disconnected)
            VALUES (?, ?, ?, ?, ?, 0)
            ON CONFLICT(id) DO UPDATE SET
                worker_id = excluded.worker_id,
                version = excluded.version,
                last_heartbeat = excluded.last_heartbeat,
                disconnected = 0
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.worker_id)
        .bind(&connection.tenant_id)
        .bind(&connection.version)
        .bind(MappingHelpers::to_millis(connection.last_heartbeat))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn connected_worker_ids(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> DispatchResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT worker_id FROM connections
            WHERE tenant_id = ? AND disconnected = 0 AND last_heartbeat >= ?
            ORDER BY worker_id
            "#,
        )
        .bind(tenant_id)
        .bind(MappingHelpers::to_millis(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("worker_id").map_err(DispatchError::from))
            .collect()
    }

    async fn disconnect_stale(&self, before: DateTime<Utc>) -> DispatchResult<u64> {
        let result = sqlx::query(
            "UPDATE connections SET disconnected = 1 WHERE disconnected = 0 AND last_heartbeat < ?",
        )
        .bind(MappingHelpers::to_millis(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn disconnect(&self, connection_id: &str) -> DispatchResult<bool> {
        let result = sqlx::query("UPDATE connections SET disconnected = 1 WHERE id = ?")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
