use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::models::{ConnectionResult, SelectionLog};
use dispatch_core::traits::{ConnectionResultRepository, SelectionLogRepository};
use dispatch_core::DispatchResult;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::database::mapping::MappingHelpers;

pub struct SqliteSelectionLogRepository {
    pool: SqlitePool,
}

impl SqliteSelectionLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_log(row: &SqliteRow) -> DispatchResult<SelectionLog> {
        Ok(SelectionLog {
            batch_id: row.try_get("batch_id")?,
            tenant_id: row.try_get("tenant_id")?,
            task_id: row.try_get("task_id")?,
            attempt: row.try_get("attempt")?,
            entries: MappingHelpers::from_json(&row.try_get::<String, _>("entries")?, "entries")?,
            sealed_at: MappingHelpers::from_millis(row.try_get("sealed_at")?)?,
        })
    }
}

#[async_trait]
impl SelectionLogRepository for SqliteSelectionLogRepository {
    async fn save(&self, log: &SelectionLog) -> DispatchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO selection_logs (batch_id, tenant_id, task_id, attempt, entries, sealed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.batch_id)
        .bind(&log.tenant_id)
        .bind(&log.task_id)
        .bind(log.attempt)
        .bind(MappingHelpers::to_json(&log.entries)?)
        .bind(MappingHelpers::to_millis(log.sealed_at))
        .execute(&self.pool)
        .await
        .map_err(|e| MappingHelpers::map_unique_violation(e, &log.batch_id))?;
        Ok(())
    }

    async fn list_by_task(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> DispatchResult<Vec<SelectionLog>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM selection_logs
            WHERE tenant_id = ? AND task_id = ?
            ORDER BY sealed_at, attempt
            "#,
        )
        .bind(tenant_id)
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_log).collect()
    }

    async fn purge_before(&self, before: DateTime<Utc>) -> DispatchResult<u64> {
        let result = sqlx::query("DELETE FROM selection_logs WHERE sealed_at < ?")
            .bind(MappingHelpers::to_millis(before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

pub struct SqliteConnectionResultRepository {
    pool: SqlitePool,
}

impl SqliteConnectionResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_result(row: &SqliteRow) -> DispatchResult<ConnectionResult> {
        Ok(ConnectionResult {
            tenant_id: row.try_get("tenant_id")?,
            worker_id: row.try_get("worker_id")?,
            criteria: row.try_get("criteria")?,
            validated: row.try_get("validated")?,
            last_updated_at: MappingHelpers::from_millis(row.try_get("last_updated_at")?)?,
        })
    }
}

#[async_trait]
impl ConnectionResultRepository for SqliteConnectionResultRepository {
    async fn upsert_all(&self, results: &[ConnectionResult]) -> DispatchResult<()> {
        let mut tx = self.pool.begin().await?;
        for result in results {
            sqlx::query(
                r#"
                INSERT INTO connection_results (tenant_id, worker_id, criteria, validated, last_updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(tenant_id, worker_id, criteria) DO UPDATE SET
                    validated = excluded.validated,
                    last_updated_at = excluded.last_updated_at
                "#,
            )
            .bind(&result.tenant_id)
            .bind(&result.worker_id)
            .bind(&result.criteria)
            .bind(result.validated)
            .bind(MappingHelpers::to_millis(result.last_updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: &str,
        worker_id: &str,
        criteria: &[String],
    ) -> DispatchResult<Vec<ConnectionResult>> {
        if criteria.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT * FROM connection_results WHERE tenant_id = ",
        );
        builder.push_bind(tenant_id);
        builder.push(" AND worker_id = ");
        builder.push_bind(worker_id);
        builder.push(" AND criteria IN (");
        let mut separated = builder.separated(", ");
        for criterion in criteria {
            separated.push_bind(criterion);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_result).collect()
    }
}
