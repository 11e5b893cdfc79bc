use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::models::{
    active_permits, Constraint, ConstraintInstance, ConstraintStrategy, FifoStrategy,
    InstanceState, ReleaseEntity,
};
use dispatch_core::traits::ConstraintRepository;
use dispatch_core::{DispatchError, DispatchResult};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

pub struct SqliteConstraintRepository {
    pool: SqlitePool,
}

impl SqliteConstraintRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_constraint(row: &SqliteRow) -> DispatchResult<Constraint> {
        let strategy: String = row.try_get("strategy")?;
        if strategy != ConstraintStrategy::Fifo.as_str() {
            return Err(DispatchError::Serialization(format!(
                "不支持的约束策略: {strategy}"
            )));
        }

        Ok(Constraint {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            name: row.try_get("name")?,
            capacity: row.try_get("capacity")?,
            strategy: ConstraintStrategy::Fifo,
            created_at: MappingHelpers::from_millis(row.try_get("created_at")?)?,
            updated_at: MappingHelpers::from_millis(row.try_get("updated_at")?)?,
        })
    }

    fn row_to_instance(row: &SqliteRow) -> DispatchResult<ConstraintInstance> {
        let state: String = row.try_get("state")?;
        let state = InstanceState::parse(&state)
            .ok_or_else(|| DispatchError::Serialization(format!("无效的实例状态: {state}")))?;

        Ok(ConstraintInstance {
            id: row.try_get("id")?,
            constraint_id: row.try_get("constraint_id")?,
            resource_unit: row.try_get("resource_unit")?,
            release_entity: ReleaseEntity {
                id: row.try_get("release_entity_id")?,
                entity_type: row.try_get("release_entity_type")?,
            },
            permits: row.try_get("permits")?,
            state,
            order: row.try_get("seq")?,
            acquired_at: MappingHelpers::opt_from_millis(row.try_get("acquired_at")?)?,
            created_at: MappingHelpers::from_millis(row.try_get("created_at")?)?,
        })
    }

    /// 先对约束行做一次空写拿到写锁，再读容量
    async fn lock_constraint(conn: &mut SqliteConnection, id: &str) -> DispatchResult<Constraint> {
        let locked = sqlx::query("UPDATE constraints SET updated_at = updated_at WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if locked.rows_affected() == 0 {
            return Err(DispatchError::constraint_not_found(id));
        }

        let row = sqlx::query("SELECT * FROM constraints WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
        Self::row_to_constraint(&row)
    }

    async fn unit_instances(
        conn: &mut SqliteConnection,
        constraint_id: &str,
        resource_unit: &str,
    ) -> DispatchResult<Vec<ConstraintInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM constraint_instances
            WHERE constraint_id = ? AND resource_unit = ?
            ORDER BY seq
            "#,
        )
        .bind(constraint_id)
        .bind(resource_unit)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(Self::row_to_instance).collect()
    }
}

#[async_trait]
impl ConstraintRepository for SqliteConstraintRepository {
    async fn insert(&self, constraint: &Constraint) -> DispatchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO constraints (id, tenant_id, name, capacity, strategy, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&constraint.id)
        .bind(&constraint.tenant_id)
        .bind(&constraint.name)
        .bind(constraint.capacity)
        .bind(constraint.strategy.as_str())
        .bind(MappingHelpers::to_millis(constraint.created_at))
        .bind(MappingHelpers::to_millis(constraint.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            MappingHelpers::map_unique_violation(
                e,
                &format!("{}/{}", constraint.tenant_id, constraint.name),
            )
        })?;
        Ok(())
    }

    async fn get(&self, id: &str) -> DispatchResult<Option<Constraint>> {
        let row = sqlx::query("SELECT * FROM constraints WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_constraint).transpose()
    }

    async fn find_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> DispatchResult<Option<Constraint>> {
        let row = sqlx::query("SELECT * FROM constraints WHERE tenant_id = ? AND name = ?")
            .bind(tenant_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_constraint).transpose()
    }

    async fn update_capacity(
        &self,
        id: &str,
        capacity: i32,
        now: DateTime<Utc>,
    ) -> DispatchResult<Constraint> {
        let mut tx = self.pool.begin().await?;
        let mut constraint = Self::lock_constraint(&mut *tx, id).await?;

        let rows = sqlx::query(
            r#"
            SELECT resource_unit, SUM(permits) AS used FROM constraint_instances
            WHERE constraint_id = ? AND state = 'ACTIVE'
            GROUP BY resource_unit
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        let mut in_use = 0i64;
        for row in &rows {
            in_use = in_use.max(row.try_get::<i64, _>("used")?);
        }

        if capacity < 1 || i64::from(capacity) < in_use {
            return Err(DispatchError::validation_error(format!(
                "容量不能小于当前占用: 新容量 {capacity}，当前占用 {in_use}"
            )));
        }

        sqlx::query("UPDATE constraints SET capacity = ?, updated_at = ? WHERE id = ?")
            .bind(capacity)
            .bind(MappingHelpers::to_millis(now))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        constraint.capacity = capacity;
        constraint.updated_at = now;
        Ok(constraint)
    }

    async fn acquire(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        release_entity: &ReleaseEntity,
        permits: i32,
        now: DateTime<Utc>,
    ) -> DispatchResult<ConstraintInstance> {
        let mut tx = self.pool.begin().await?;
        let constraint = Self::lock_constraint(&mut *tx, constraint_id).await?;
        let instances = Self::unit_instances(&mut *tx, constraint_id, resource_unit).await?;

        if let Some(existing) = instances
            .iter()
            .find(|i| i.release_entity.id == release_entity.id)
        {
            return Ok(existing.clone());
        }

        if permits < 1 || permits > constraint.capacity {
            return Err(DispatchError::validation_error(format!(
                "许可数必须在1到容量{}之间，当前值: {permits}",
                constraint.capacity
            )));
        }

        let (state, acquired_at) = if FifoStrategy::admits(constraint.capacity, &instances, permits)
        {
            (InstanceState::Active, Some(now))
        } else {
            (InstanceState::Blocked, None)
        };

        let row = sqlx::query(
            r#"
            INSERT INTO constraint_instances (
                id, constraint_id, resource_unit, release_entity_id, release_entity_type,
                permits, state, acquired_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(constraint_id)
        .bind(resource_unit)
        .bind(&release_entity.id)
        .bind(&release_entity.entity_type)
        .bind(permits)
        .bind(state.as_str())
        .bind(MappingHelpers::opt_to_millis(acquired_at))
        .bind(MappingHelpers::to_millis(now))
        .fetch_one(&mut *tx)
        .await?;
        let instance = Self::row_to_instance(&row)?;
        tx.commit().await?;

        debug!(
            "约束 {} 单元 {} 申请许可 {}: {}",
            constraint_id,
            resource_unit,
            permits,
            instance.state.as_str()
        );
        Ok(instance)
    }

    async fn release(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        release_entity_id: &str,
    ) -> DispatchResult<Option<ConstraintInstance>> {
        let row = sqlx::query(
            r#"
            DELETE FROM constraint_instances
            WHERE constraint_id = ? AND resource_unit = ? AND release_entity_id = ?
            RETURNING *
            "#,
        )
        .bind(constraint_id)
        .bind(resource_unit)
        .bind(release_entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_instance).transpose()
    }

    async fn promote(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<ConstraintInstance>> {
        let mut tx = self.pool.begin().await?;
        let constraint = Self::lock_constraint(&mut *tx, constraint_id).await?;
        let instances = Self::unit_instances(&mut *tx, constraint_id, resource_unit).await?;

        let promotable = FifoStrategy::promotable(constraint.capacity, &instances);
        if promotable.is_empty() {
            return Ok(Vec::new());
        }

        let mut promoted = Vec::with_capacity(promotable.len());
        for id in &promotable {
            let row = sqlx::query(
                r#"
                UPDATE constraint_instances SET state = 'ACTIVE', acquired_at = ?
                WHERE id = ? AND state = 'BLOCKED'
                RETURNING *
                "#,
            )
            .bind(MappingHelpers::to_millis(now))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            promoted.push(Self::row_to_instance(&row)?);
        }
        tx.commit().await?;

        debug!(
            "约束 {} 单元 {} 提升 {} 个实例，占用 {}/{}",
            constraint_id,
            resource_unit,
            promoted.len(),
            active_permits(&instances) + promoted.iter().map(|i| i.permits).sum::<i32>(),
            constraint.capacity
        );
        Ok(promoted)
    }

    async fn list_instances(
        &self,
        constraint_id: &str,
        resource_unit: &str,
    ) -> DispatchResult<Vec<ConstraintInstance>> {
        let mut conn = self.pool.acquire().await?;
        Self::unit_instances(&mut *conn, constraint_id, resource_unit).await
    }

    async fn resource_units(&self, constraint_id: &str) -> DispatchResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT resource_unit FROM constraint_instances WHERE constraint_id = ? ORDER BY resource_unit",
        )
        .bind(constraint_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("resource_unit").map_err(DispatchError::from))
            .collect()
    }

    async fn list_by_state(&self, state: InstanceState) -> DispatchResult<Vec<ConstraintInstance>> {
        let rows = sqlx::query("SELECT * FROM constraint_instances WHERE state = ? ORDER BY seq")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_instance).collect()
    }
}
