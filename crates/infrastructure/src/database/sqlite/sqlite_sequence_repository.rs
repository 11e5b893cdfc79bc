use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::models::SequenceIdentity;
use dispatch_core::traits::SequenceRepository;
use dispatch_core::DispatchResult;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::database::mapping::MappingHelpers;

pub struct SqliteSequenceRepository {
    pool: SqlitePool,
}

impl SqliteSequenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_identity(row: &SqliteRow) -> DispatchResult<SequenceIdentity> {
        Ok(SequenceIdentity {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            hostname_prefix: row.try_get("hostname_prefix")?,
            sequence_number: row.try_get("sequence_number")?,
            token: row.try_get("token")?,
            last_updated_at: MappingHelpers::from_millis(row.try_get("last_updated_at")?)?,
        })
    }
}

#[async_trait]
impl SequenceRepository for SqliteSequenceRepository {
    async fn get(
        &self,
        tenant_id: &str,
        hostname_prefix: &str,
        sequence_number: i32,
    ) -> DispatchResult<Option<SequenceIdentity>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sequence_identities
            WHERE tenant_id = ? AND hostname_prefix = ? AND sequence_number = ?
            "#,
        )
        .bind(tenant_id)
        .bind(hostname_prefix)
        .bind(sequence_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_identity).transpose()
    }

    async fn list(
        &self,
        tenant_id: &str,
        hostname_prefix: &str,
    ) -> DispatchResult<Vec<SequenceIdentity>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sequence_identities
            WHERE tenant_id = ? AND hostname_prefix = ?
            ORDER BY sequence_number
            "#,
        )
        .bind(tenant_id)
        .bind(hostname_prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_identity).collect()
    }

    async fn insert(&self, identity: &SequenceIdentity) -> DispatchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sequence_identities
                (id, tenant_id, hostname_prefix, sequence_number, token, last_updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&identity.id)
        .bind(&identity.tenant_id)
        .bind(&identity.hostname_prefix)
        .bind(identity.sequence_number)
        .bind(&identity.token)
        .bind(MappingHelpers::to_millis(identity.last_updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            MappingHelpers::map_unique_violation(
                e,
                &format!("{}/{}", identity.hostname_prefix, identity.sequence_number),
            )
        })?;
        Ok(())
    }

    async fn rebind_if_stale(
        &self,
        id: &str,
        new_token: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sequence_identities SET token = ?, last_updated_at = ?
            WHERE id = ? AND last_updated_at < ?
            "#,
        )
        .bind(new_token)
        .bind(MappingHelpers::to_millis(now))
        .bind(id)
        .bind(MappingHelpers::to_millis(stale_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(
        &self,
        tenant_id: &str,
        hostname_prefix: &str,
        sequence_number: i32,
        token: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sequence_identities SET last_updated_at = ?
            WHERE tenant_id = ? AND hostname_prefix = ? AND sequence_number = ? AND token = ?
            "#,
        )
        .bind(MappingHelpers::to_millis(now))
        .bind(tenant_id)
        .bind(hostname_prefix)
        .bind(sequence_number)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
