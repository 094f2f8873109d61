//! # Schema Migrations
//!
//! SQL files under `migrations/sqlite/` at the workspace root, compiled into
//! the binary with `sqlx::migrate!`. Every `Database::new` applies whatever
//! the file has not seen yet, so a branch server upgraded in place picks up
//! new tables on its next start.
//!
//! ```text
//! migrations/sqlite/
//! └── 001_initial_schema.sql   queue_entries, queue_dependencies,
//!                              queue_attempts, remote_identity_mappings,
//!                              partition_bindings
//! ```
//!
//! Applied files are tracked in `_sqlx_migrations` with their checksum.
//! Editing a shipped file breaks startup on every branch that applied it;
//! add `NNN_description.sql` instead.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Applies pending migrations, each in its own transaction.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    let before = applied_versions(pool).await?;
    MIGRATOR.run(pool).await?;

    let fresh: Vec<i64> = MIGRATOR
        .iter()
        .map(|m| m.version)
        .filter(|v| !before.contains(v))
        .collect();
    if fresh.is_empty() {
        info!(version = ?latest_version(), "Queue schema up to date");
    } else {
        info!(applied = ?fresh, "Queue schema migrated");
    }
    Ok(())
}

/// Highest migration version embedded in this build.
pub fn latest_version() -> Option<i64> {
    MIGRATOR.iter().map(|m| m.version).max()
}

/// Versions recorded as applied. Empty on a brand new file.
pub async fn applied_versions(pool: &SqlitePool) -> DbResult<Vec<i64>> {
    let tracked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_one(pool)
    .await?;
    if tracked == 0 {
        return Ok(Vec::new());
    }

    let versions = sqlx::query_scalar(
        "SELECT version FROM _sqlx_migrations WHERE success = 1 ORDER BY version",
    )
    .fetch_all(pool)
    .await?;
    Ok(versions)
}
