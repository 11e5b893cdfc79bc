use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::models::{Task, TaskStatus};
use dispatch_core::traits::TaskRepository;
use dispatch_core::DispatchResult;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> DispatchResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            queue: row.try_get("queue")?,
            version: row.try_get("version")?,
            data: MappingHelpers::from_json(&row.try_get::<String, _>("data")?, "data")?,
            setup_abstractions: MappingHelpers::from_json(
                &row.try_get::<String, _>("setup_abstractions")?,
                "setup_abstractions",
            )?,
            selectors: MappingHelpers::from_json(
                &row.try_get::<String, _>("selectors")?,
                "selectors",
            )?,
            capabilities: MappingHelpers::from_json(
                &row.try_get::<String, _>("capabilities")?,
                "capabilities",
            )?,
            pre_assigned_worker_id: row.try_get("pre_assigned_worker_id")?,
            must_execute_on_worker_id: row.try_get("must_execute_on_worker_id")?,
            already_tried: MappingHelpers::from_json(
                &row.try_get::<String, _>("already_tried")?,
                "already_tried",
            )?,
            validating_worker_ids: MappingHelpers::from_json(
                &row.try_get::<String, _>("validating_worker_ids")?,
                "validating_worker_ids",
            )?,
            validation_started_at: MappingHelpers::opt_from_millis(
                row.try_get("validation_started_at")?,
            )?,
            broadcast_count: row.try_get("broadcast_count")?,
            next_broadcast_at: MappingHelpers::opt_from_millis(row.try_get("next_broadcast_at")?)?,
            worker_id: row.try_get("worker_id")?,
            status: row.try_get("status")?,
            wait_id: row.try_get("wait_id")?,
            driver_id: row.try_get("driver_id")?,
            created_at: MappingHelpers::from_millis(row.try_get("created_at")?)?,
            expires_at: MappingHelpers::from_millis(row.try_get("expires_at")?)?,
            updated_at: MappingHelpers::from_millis(row.try_get("updated_at")?)?,
        })
    }

    fn rows_to_tasks(rows: &[SqliteRow]) -> DispatchResult<Vec<Task>> {
        rows.iter().map(Self::row_to_task).collect()
    }

    /// 在事务内先写后读，拿到写锁后其他写者必须等待本事务结束
    async fn lock_task(conn: &mut SqliteConnection, id: &str) -> DispatchResult<Option<Task>> {
        let locked = sqlx::query("UPDATE tasks SET updated_at = updated_at WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if locked.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
        Ok(Some(Self::row_to_task(&row)?))
    }

    async fn write_assignment(conn: &mut SqliteConnection, task: &Task) -> DispatchResult<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, worker_id = ?, already_tried = ?, validating_worker_ids = ?,
                validation_started_at = ?, next_broadcast_at = ?, expires_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status)
        .bind(&task.worker_id)
        .bind(MappingHelpers::to_json(&task.already_tried)?)
        .bind(MappingHelpers::to_json(&task.validating_worker_ids)?)
        .bind(MappingHelpers::opt_to_millis(task.validation_started_at))
        .bind(MappingHelpers::opt_to_millis(task.next_broadcast_at))
        .bind(MappingHelpers::to_millis(task.expires_at))
        .bind(MappingHelpers::to_millis(task.updated_at))
        .bind(&task.id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn save(&self, task: &Task, initial_status: TaskStatus) -> DispatchResult<Task> {
        let mut stored = task.clone();
        stored.status = initial_status;
        if stored.must_execute_on_worker_id.is_some() {
            stored.next_broadcast_at = None;
        }

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, tenant_id, queue, version, data, setup_abstractions, selectors, capabilities,
                pre_assigned_worker_id, must_execute_on_worker_id, already_tried, validating_worker_ids,
                validation_started_at, broadcast_count, next_broadcast_at, worker_id, status,
                wait_id, driver_id, created_at, expires_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stored.id)
        .bind(&stored.tenant_id)
        .bind(&stored.queue)
        .bind(&stored.version)
        .bind(MappingHelpers::to_json(&stored.data)?)
        .bind(MappingHelpers::to_json(&stored.setup_abstractions)?)
        .bind(MappingHelpers::to_json(&stored.selectors)?)
        .bind(MappingHelpers::to_json(&stored.capabilities)?)
        .bind(&stored.pre_assigned_worker_id)
        .bind(&stored.must_execute_on_worker_id)
        .bind(MappingHelpers::to_json(&stored.already_tried)?)
        .bind(MappingHelpers::to_json(&stored.validating_worker_ids)?)
        .bind(MappingHelpers::opt_to_millis(stored.validation_started_at))
        .bind(stored.broadcast_count)
        .bind(MappingHelpers::opt_to_millis(stored.next_broadcast_at))
        .bind(&stored.worker_id)
        .bind(stored.status)
        .bind(&stored.wait_id)
        .bind(&stored.driver_id)
        .bind(MappingHelpers::to_millis(stored.created_at))
        .bind(MappingHelpers::to_millis(stored.expires_at))
        .bind(MappingHelpers::to_millis(stored.updated_at))
        .execute(&self.pool)
        .await?;

        debug!("保存任务: {} 状态: {}", stored.id, stored.status);
        Ok(stored)
    }

    async fn get(&self, id: &str) -> DispatchResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn update_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> DispatchResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(MappingHelpers::to_millis(Utc::now()))
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_acquirable(
        &self,
        tenant_id: &str,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DispatchResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE tenant_id = ? AND queue = ? AND status = 'QUEUED' AND worker_id IS NULL
              AND expires_at > ?
              AND (must_execute_on_worker_id IS NULL OR must_execute_on_worker_id = ?)
            ORDER BY created_at, id
            LIMIT ?
            "#,
        )
        .bind(tenant_id)
        .bind(queue)
        .bind(MappingHelpers::to_millis(now))
        .bind(worker_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_tasks(&rows)
    }

    async fn assign(
        &self,
        id: &str,
        worker_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'STARTED', worker_id = ?, expires_at = ?, validating_worker_ids = '[]',
                validation_started_at = NULL, next_broadcast_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'QUEUED' AND worker_id IS NULL
              AND (must_execute_on_worker_id IS NULL OR must_execute_on_worker_id = ?)
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(MappingHelpers::to_millis(expires_at))
        .bind(MappingHelpers::to_millis(now))
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn start_validation(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(mut task) = Self::lock_task(&mut *tx, id).await? else {
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
        Self::write_assignment(&mut *tx, &task).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn mark_tried(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut task) = Self::lock_task(&mut *tx, id).await? else {
            return Ok(None);
        };
        if task.status != TaskStatus::Queued {
            return Ok(None);
        }

        task.mark_tried(worker_id);
        task.updated_at = now;
        Self::write_assignment(&mut *tx, &task).await?;
        tx.commit().await?;
        Ok(Some(task))
    }

    async fn release_stale_validations(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET validating_worker_ids = '[]', validation_started_at = NULL,
                next_broadcast_at = CASE WHEN must_execute_on_worker_id IS NULL
                                         THEN ? ELSE next_broadcast_at END,
                updated_at = ?
            WHERE status = 'QUEUED' AND worker_id IS NULL
              AND validation_started_at IS NOT NULL AND validation_started_at <= ?
            RETURNING *
            "#,
        )
        .bind(MappingHelpers::to_millis(now))
        .bind(MappingHelpers::to_millis(now))
        .bind(MappingHelpers::to_millis(stale_before))
        .fetch_all(&self.pool)
        .await?;

        let released = Self::rows_to_tasks(&rows)?;
        if !released.is_empty() {
            debug!("释放超时验证 {} 个", released.len());
        }
        Ok(released)
    }

    async fn requeue(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut task) = Self::lock_task(&mut *tx, id).await? else {
            return Ok(None);
        };
        if task.status != TaskStatus::Started || task.worker_id.as_deref() != Some(worker_id) {
            return Ok(None);
        }

        task.status = TaskStatus::Queued;
        task.worker_id = None;
        task.mark_tried(worker_id);
        task.next_broadcast_at = Some(now);
        task.updated_at = now;
        Self::write_assignment(&mut *tx, &task).await?;
        tx.commit().await?;
        Ok(Some(task))
    }

    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = ?, updated_at = ?
            WHERE id = ? AND status = 'STARTED' AND worker_id = ?
            "#,
        )
        .bind(to)
        .bind(MappingHelpers::to_millis(now))
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_broadcast(
        &self,
        id: &str,
        next_broadcast_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET broadcast_count = broadcast_count + 1, next_broadcast_at = ?, updated_at = ?
            WHERE id = ? AND status = 'QUEUED'
            RETURNING *
            "#,
        )
        .bind(MappingHelpers::opt_to_millis(next_broadcast_at))
        .bind(MappingHelpers::to_millis(now))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn find_due_for_broadcast(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DispatchResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status = 'QUEUED' AND worker_id IS NULL AND must_execute_on_worker_id IS NULL
              AND next_broadcast_at IS NOT NULL AND next_broadcast_at <= ?
            ORDER BY next_broadcast_at
            LIMIT ?
            "#,
        )
        .bind(MappingHelpers::to_millis(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_tasks(&rows)
    }

    async fn mark_expired(
        &self,
        now: DateTime<Utc>,
        max_broadcast_rounds: i32,
    ) -> DispatchResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'ERROR', next_broadcast_at = NULL, updated_at = ?
            WHERE status IN ('QUEUED', 'STARTED')
              AND (expires_at <= ?
                   OR (status = 'QUEUED' AND worker_id IS NULL AND broadcast_count >= ?))
            RETURNING *
            "#,
        )
        .bind(MappingHelpers::to_millis(now))
        .bind(MappingHelpers::to_millis(now))
        .bind(max_broadcast_rounds)
        .fetch_all(&self.pool)
        .await?;

        let expired = Self::rows_to_tasks(&rows)?;
        if !expired.is_empty() {
            debug!("回收过期任务 {} 个", expired.len());
        }
        Ok(expired)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> DispatchResult<u64> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE status IN ('ABORTED', 'ERROR', 'FINISHED') AND updated_at < ?",
        )
        .bind(MappingHelpers::to_millis(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
