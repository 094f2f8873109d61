//! # Queue Store Handle
//!
//! Opens the SQLite file that backs the replication queue and hands out
//! repositories over one shared pool.
//!
//! ## Who Shares the Pool
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Shared SqlitePool                               │
//! │                                                                         │
//! │  SyncGateway ────► enqueue            (POS write path, after commit)   │
//! │  DispatchWorker ─► claim_batch/mark   (N per partition)                │
//! │  RetentionWorker ► reap/complete/purge                                 │
//! │  Operator ───────► list/show/retry    (harbor-ctl, status queries)     │
//! │                                                                         │
//! │  SQLite serializes writers; busy_timeout makes a writer wait its turn  │
//! │  instead of failing. Claims are single statements, so two workers      │
//! │  never receive the same entry.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The file runs in WAL mode: operator reads never stall the claim writer,
//! and a committed enqueue survives a crash of the POS process.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::binding::BindingRepository;
use crate::repository::identity::IdentityRepository;
use crate::repository::queue::QueueRepository;

const IN_MEMORY: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Where the queue lives and how many connections may touch it.
///
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/harbor/queue.db")
///     .max_connections(8)
///     .busy_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: PathBuf,

    /// Upper bound on pooled connections. Default: 5.
    pub max_connections: u32,

    /// How long `acquire` waits for a free connection. Default: 30s.
    pub acquire_timeout: Duration,

    /// How long a writer waits on a locked database. Default: 5s.
    pub busy_timeout: Duration,

    /// Apply embedded migrations on open. Default: true.
    pub run_migrations: bool,
}

impl DbConfig {
    /// File-backed queue; the file is created on first open.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }

    /// Throwaway queue for tests. One connection, because every SQLite
    /// `:memory:` connection is its own database.
    pub fn in_memory() -> Self {
        DbConfig {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            ..DbConfig::new(IN_MEMORY)
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path == Path::new(IN_MEMORY)
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let options = if self.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.database_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };

        // Attempt history cascades from queue entries.
        Ok(options.foreign_keys(true).busy_timeout(self.busy_timeout))
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        let options = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(1)
            .acquire_timeout(self.acquire_timeout);

        if self.is_in_memory() {
            // Closing the last connection would drop the database.
            options.idle_timeout(None).max_lifetime(None)
        } else {
            options.idle_timeout(Some(Duration::from_secs(600)))
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the queue store. Clones share one pool.
///
/// ```rust,ignore
/// let db = Database::new(DbConfig::new("queue.db")).await?;
/// let queued = db.queue().enqueue(new_entry).await?;
/// let batch = db.queue().claim_batch(&partition, 20).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the queue store and brings its schema up to date.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            max_connections = config.max_connections,
            "Opening queue store"
        );

        let pool = config
            .pool_options()
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        let db = Database { pool };
        if config.run_migrations {
            migrations::run_migrations(&db.pool).await?;
        } else {
            debug!("Skipping migrations");
        }

        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn queue(&self) -> QueueRepository {
        QueueRepository::new(self.pool.clone())
    }

    pub fn identities(&self) -> IdentityRepository {
        IdentityRepository::new(self.pool.clone())
    }

    pub fn bindings(&self) -> BindingRepository {
        BindingRepository::new(self.pool.clone())
    }

    /// Folds the WAL back into the main file. Worth doing after a large
    /// purge so the file on disk shrinks back.
    pub async fn checkpoint(&self) -> DbResult<()> {
        debug!("WAL checkpoint");
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Waits for in-flight queries, then closes every connection.
    pub async fn close(&self) {
        info!("Closing queue store");
        self.pool.close().await;
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
