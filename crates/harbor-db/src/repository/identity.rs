//! # Remote Identity Mapping Repository
//!
//! Persists what the remote system knows each local record by. Mappings are
//! created on first successful reconciliation, refreshed on every later sync
//! and never deleted automatically.

use chrono::{DateTime, Utc};
use harbor_core::{EntityType, IdentityProbe, RemoteIdentityMapping};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use crate::repository::queue::{from_millis, to_millis};

const MAPPING_COLUMNS: &str = "entity_type, local_record_id, remote_record_id, business_key, \
     legacy_id, natural_key, name, contact, first_synced_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct MappingRow {
    entity_type: EntityType,
    local_record_id: String,
    remote_record_id: Option<String>,
    business_key: Option<String>,
    legacy_id: Option<String>,
    natural_key: Option<String>,
    name: Option<String>,
    contact: Option<String>,
    first_synced_at: i64,
    updated_at: i64,
}

impl MappingRow {
    fn into_mapping(self) -> DbResult<RemoteIdentityMapping> {
        Ok(RemoteIdentityMapping {
            entity_type: self.entity_type,
            local_record_id: self.local_record_id,
            remote_record_id: self.remote_record_id,
            identity: IdentityProbe {
                business_key: self.business_key,
                legacy_id: self.legacy_id,
                natural_key: self.natural_key,
                name: self.name,
                contact: self.contact,
            },
            first_synced_at: from_millis(self.first_synced_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn blank_to_none(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Repository for remote identity mappings.
#[derive(Debug, Clone)]
pub struct IdentityRepository {
    pool: SqlitePool,
}

impl IdentityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        IdentityRepository { pool }
    }

    /// Creates or refreshes the mapping for a local record.
    ///
    /// Known values are never erased by a later sync that lacks them: a
    /// missing remote id or identity field keeps the stored one.
    pub async fn record(
        &self,
        entity_type: EntityType,
        local_record_id: &str,
        remote_record_id: Option<&str>,
        identity: &IdentityProbe,
    ) -> DbResult<RemoteIdentityMapping> {
        self.record_at(entity_type, local_record_id, remote_record_id, identity, Utc::now())
            .await
    }

    pub async fn record_at(
        &self,
        entity_type: EntityType,
        local_record_id: &str,
        remote_record_id: Option<&str>,
        identity: &IdentityProbe,
        now: DateTime<Utc>,
    ) -> DbResult<RemoteIdentityMapping> {
        let sql = format!(
            r#"
            INSERT INTO remote_identity_mappings (
                entity_type, local_record_id, remote_record_id, business_key,
                legacy_id, natural_key, name, contact, first_synced_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT (entity_type, local_record_id) DO UPDATE SET
                remote_record_id = COALESCE(excluded.remote_record_id, remote_record_id),
                business_key = COALESCE(excluded.business_key, business_key),
                legacy_id = COALESCE(excluded.legacy_id, legacy_id),
                natural_key = COALESCE(excluded.natural_key, natural_key),
                name = COALESCE(excluded.name, name),
                contact = COALESCE(excluded.contact, contact),
                updated_at = excluded.updated_at
            RETURNING {MAPPING_COLUMNS}
            "#
        );

        let row: MappingRow = sqlx::query_as(&sql)
            .bind(entity_type)
            .bind(local_record_id)
            .bind(blank_to_none(remote_record_id))
            .bind(blank_to_none(identity.business_key()))
            .bind(blank_to_none(identity.legacy_id()))
            .bind(blank_to_none(identity.natural_key()))
            .bind(blank_to_none(identity.name.as_deref()))
            .bind(blank_to_none(identity.contact.as_deref()))
            .bind(to_millis(now))
            .fetch_one(&self.pool)
            .await?;

        debug!(
            entity_type = %entity_type,
            local_record_id,
            remote_record_id = row.remote_record_id.as_deref().unwrap_or("-"),
            "Identity mapping recorded"
        );
        row.into_mapping()
    }

    /// Mapping for a local record.
    pub async fn get(
        &self,
        entity_type: EntityType,
        local_record_id: &str,
    ) -> DbResult<Option<RemoteIdentityMapping>> {
        let sql = format!(
            "SELECT {MAPPING_COLUMNS} FROM remote_identity_mappings \
             WHERE entity_type = ?1 AND local_record_id = ?2"
        );
        let row: Option<MappingRow> = sqlx::query_as(&sql)
            .bind(entity_type)
            .bind(local_record_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(MappingRow::into_mapping).transpose()
    }

    pub async fn find_by_business_key(
        &self,
        entity_type: EntityType,
        business_key: &str,
    ) -> DbResult<Option<RemoteIdentityMapping>> {
        Ok(self
            .find_by_column(entity_type, "business_key", business_key)
            .await?
            .into_iter()
            .next())
    }

    pub async fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_record_id: &str,
    ) -> DbResult<Option<RemoteIdentityMapping>> {
        Ok(self
            .find_by_column(entity_type, "remote_record_id", remote_record_id)
            .await?
            .into_iter()
            .next())
    }

    /// Candidates sharing a legacy identifier. Callers must corroborate.
    pub async fn find_by_legacy_id(
        &self,
        entity_type: EntityType,
        legacy_id: &str,
    ) -> DbResult<Vec<RemoteIdentityMapping>> {
        self.find_by_column(entity_type, "legacy_id", legacy_id).await
    }

    /// Candidates sharing a natural key. Callers must corroborate.
    pub async fn find_by_natural_key(
        &self,
        entity_type: EntityType,
        natural_key: &str,
    ) -> DbResult<Vec<RemoteIdentityMapping>> {
        self.find_by_column(entity_type, "natural_key", natural_key).await
    }

    async fn find_by_column(
        &self,
        entity_type: EntityType,
        column: &'static str,
        value: &str,
    ) -> DbResult<Vec<RemoteIdentityMapping>> {
        let sql = format!(
            "SELECT {MAPPING_COLUMNS} FROM remote_identity_mappings \
             WHERE entity_type = ?1 AND {column} = ?2 \
             ORDER BY first_synced_at, local_record_id"
        );
        let rows: Vec<MappingRow> = sqlx::query_as(&sql)
            .bind(entity_type)
            .bind(value.trim())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(MappingRow::into_mapping).collect()
    }
}
