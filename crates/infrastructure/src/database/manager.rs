use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dispatch_core::config::DatabaseConfig;
use dispatch_core::traits::{
    ConnectionRepository, ConnectionResultRepository, ConstraintRepository,
    SelectionLogRepository, SequenceRepository, TaskRepository, WorkerRepository,
};
use dispatch_core::DispatchResult;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::sqlite::{
    SqliteConnectionRepository, SqliteConnectionResultRepository, SqliteConstraintRepository,
    SqliteSelectionLogRepository, SqliteSequenceRepository, SqliteTaskRepository,
    SqliteWorkerRepository,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        queue TEXT NOT NULL,
        version TEXT NOT NULL,
        data TEXT NOT NULL,
        setup_abstractions TEXT NOT NULL,
        selectors TEXT NOT NULL,
        capabilities TEXT NOT NULL,
        pre_assigned_worker_id TEXT,
        must_execute_on_worker_id TEXT,
        already_tried TEXT NOT NULL,
        validating_worker_ids TEXT NOT NULL,
        validation_started_at INTEGER,
        broadcast_count INTEGER NOT NULL DEFAULT 0,
        next_broadcast_at INTEGER,
        worker_id TEXT,
        status TEXT NOT NULL,
        wait_id TEXT,
        driver_id TEXT,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_acquire ON tasks(tenant_id, queue, status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_broadcast ON tasks(status, next_broadcast_at)",
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        hostname TEXT NOT NULL,
        ip_address TEXT NOT NULL,
        hostname_prefix TEXT,
        sequence_number INTEGER,
        token TEXT,
        tags TEXT NOT NULL,
        scopes TEXT NOT NULL,
        version TEXT NOT NULL,
        status TEXT NOT NULL,
        last_heartbeat INTEGER NOT NULL,
        registered_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workers_hostname ON workers(tenant_id, hostname)",
    r#"
    CREATE TABLE IF NOT EXISTS connections (
        id TEXT PRIMARY KEY,
        worker_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        version TEXT NOT NULL,
        last_heartbeat INTEGER NOT NULL,
        disconnected INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_connections_tenant ON connections(tenant_id, disconnected, last_heartbeat)",
    r#"
    CREATE TABLE IF NOT EXISTS sequence_identities (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        hostname_prefix TEXT NOT NULL,
        sequence_number INTEGER NOT NULL,
        token TEXT NOT NULL,
        last_updated_at INTEGER NOT NULL,
        UNIQUE(tenant_id, hostname_prefix, sequence_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS selection_logs (
        batch_id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        entries TEXT NOT NULL,
        sealed_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_selection_logs_task ON selection_logs(tenant_id, task_id)",
    "CREATE INDEX IF NOT EXISTS idx_selection_logs_sealed ON selection_logs(sealed_at)",
    r#"
    CREATE TABLE IF NOT EXISTS connection_results (
        tenant_id TEXT NOT NULL,
        worker_id TEXT NOT NULL,
        criteria TEXT NOT NULL,
        validated INTEGER NOT NULL,
        last_updated_at INTEGER NOT NULL,
        PRIMARY KEY(tenant_id, worker_id, criteria)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS constraints (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL,
        capacity INTEGER NOT NULL,
        strategy TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(tenant_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS constraint_instances (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        constraint_id TEXT NOT NULL,
        resource_unit TEXT NOT NULL,
        release_entity_id TEXT NOT NULL,
        release_entity_type TEXT NOT NULL,
        permits INTEGER NOT NULL,
        state TEXT NOT NULL,
        acquired_at INTEGER,
        created_at INTEGER NOT NULL,
        UNIQUE(constraint_id, resource_unit, release_entity_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_constraint_instances_state ON constraint_instances(state)",
];

/// SQLite连接池与仓储工厂
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> DispatchResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        let pool_options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds));

        // 内存库每个连接都是独立数据库，只能用一个永不回收的连接
        let pool_options = if config.is_in_memory() {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
        };

        let pool = pool_options.connect_with(options).await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 建表，可重复执行
    pub async fn migrate(&self) -> DispatchResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("数据库表结构已就绪");
        Ok(())
    }

    pub async fn health_check(&self) -> DispatchResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn task_repository(&self) -> Arc<dyn TaskRepository> {
        Arc::new(SqliteTaskRepository::new(self.pool.clone()))
    }

    pub fn worker_repository(&self) -> Arc<dyn WorkerRepository> {
        Arc::new(SqliteWorkerRepository::new(self.pool.clone()))
    }

    pub fn connection_repository(&self) -> Arc<dyn ConnectionRepository> {
        Arc::new(SqliteConnectionRepository::new(self.pool.clone()))
    }

    pub fn sequence_repository(&self) -> Arc<dyn SequenceRepository> {
        Arc::new(SqliteSequenceRepository::new(self.pool.clone()))
    }

    pub fn selection_log_repository(&self) -> Arc<dyn SelectionLogRepository> {
        Arc::new(SqliteSelectionLogRepository::new(self.pool.clone()))
    }

    pub fn connection_result_repository(&self) -> Arc<dyn ConnectionResultRepository> {
        Arc::new(SqliteConnectionResultRepository::new(self.pool.clone()))
    }

    pub fn constraint_repository(&self) -> Arc<dyn ConstraintRepository> {
        Arc::new(SqliteConstraintRepository::new(self.pool.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        };
        let manager = DatabaseManager::new(&config).await.unwrap();
        manager.migrate().await.unwrap();
        manager.migrate().await.unwrap();
        manager.health_check().await.unwrap();
        manager.close().await;
    }
}
