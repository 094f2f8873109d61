//! # Partition Binding Repository
//!
//! Maps a branch to the partition (and remote endpoint) its records
//! replicate to. Seeded from configuration at startup.

use chrono::{DateTime, Utc};
use harbor_core::PartitionKey;
use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;
use crate::repository::queue::{from_millis, to_millis};

/// A branch-to-partition binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBinding {
    pub branch_id: String,
    pub partition: PartitionKey,
    pub endpoint: String,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct BindingRow {
    branch_id: String,
    partition_key: String,
    endpoint: String,
    active: bool,
    updated_at: i64,
}

impl BindingRow {
    fn into_binding(self) -> DbResult<PartitionBinding> {
        Ok(PartitionBinding {
            branch_id: self.branch_id,
            partition: PartitionKey::new(self.partition_key),
            endpoint: self.endpoint,
            active: self.active,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

/// Repository for partition bindings.
#[derive(Debug, Clone)]
pub struct BindingRepository {
    pool: SqlitePool,
}

impl BindingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        BindingRepository { pool }
    }

    /// Creates or replaces the binding for a branch and activates it.
    pub async fn upsert(
        &self,
        branch_id: &str,
        partition: &PartitionKey,
        endpoint: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO partition_bindings (branch_id, partition_key, endpoint, active, updated_at)
            VALUES (?1, ?2, ?3, 1, ?4)
            ON CONFLICT (branch_id) DO UPDATE SET
                partition_key = excluded.partition_key,
                endpoint = excluded.endpoint,
                active = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(branch_id)
        .bind(partition.as_str())
        .bind(endpoint)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        info!(branch_id, partition = %partition, endpoint, "Partition binding stored");
        Ok(())
    }

    /// Active binding for a branch, if any.
    pub async fn active_for_branch(&self, branch_id: &str) -> DbResult<Option<PartitionBinding>> {
        let row: Option<BindingRow> = sqlx::query_as(
            r#"
            SELECT branch_id, partition_key, endpoint, active, updated_at
            FROM partition_bindings
            WHERE branch_id = ?1 AND active = 1
            "#,
        )
        .bind(branch_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BindingRow::into_binding).transpose()
    }

    /// Every binding, active or not.
    pub async fn list(&self) -> DbResult<Vec<PartitionBinding>> {
        let rows: Vec<BindingRow> = sqlx::query_as(
            r#"
            SELECT branch_id, partition_key, endpoint, active, updated_at
            FROM partition_bindings
            ORDER BY branch_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BindingRow::into_binding).collect()
    }

    /// Stops routing a branch. Already-queued entries are unaffected.
    pub async fn deactivate(&self, branch_id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE partition_bindings SET active = 0, updated_at = ?2 WHERE branch_id = ?1 AND active = 1",
        )
        .bind(branch_id)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
