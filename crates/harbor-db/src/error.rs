//! # Queue Store Errors
//!
//! ```text
//! sqlx::Error ──► DbError ──► SyncError::Database ──► worker log / CLI exit
//! ```
//!
//! Constraint failures are classified from sqlx's `ErrorKind`, and lock
//! contention from SQLite's primary result code (`SQLITE_BUSY` = 5,
//! `SQLITE_LOCKED` = 6), so callers never have to match on message text.

use harbor_core::{CoreError, EntryState};
use sqlx::error::ErrorKind as SqlxErrorKind;
use thiserror::Error;

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

#[derive(Debug, Error)]
pub enum DbError {
    /// No row for the id: never existed, or purged.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// ## When This Occurs
    /// - Two active entries for the same (type, record, partition) racing
    ///   past the upsert
    /// - Duplicate identity mapping for a local record
    #[error("Unique constraint failed: {constraint}")]
    UniqueViolation { constraint: String },

    /// ## When This Occurs
    /// - Attempt history or dependency rows for an entry that is gone
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// A CHECK constraint refused the row (bad tag, forward dependency).
    #[error("Check constraint failed: {message}")]
    CheckViolation { message: String },

    /// The entry's current state does not allow the requested move.
    ///
    /// ## When This Occurs
    /// - Marking an entry synced or errored that is not `Processing`
    /// - Resetting or skipping a `Synced` / `Skipped` entry
    #[error("Entry {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: EntryState,
        to: EntryState,
    },

    /// The entry was reaped and possibly claimed again since this claim
    /// was handed out; the outcome belongs to nobody.
    ///
    /// ## When This Occurs
    /// - A worker reports an outcome after `reap_stuck_processing` took
    ///   the entry back
    #[error("Entry {id}: claim is no longer held")]
    ClaimLost { id: i64 },

    /// Another connection holds the write lock past `busy_timeout`.
    #[error("Queue store busy: {0}")]
    Busy(String),

    /// No connection freed up within the acquire timeout.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A stored row could not be turned back into a domain value.
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
        DbError::CorruptRow {
            table,
            reason: reason.into(),
        }
    }

    /// Contention that clears up by itself; the next cycle may retry.
    pub fn is_busy(&self) -> bool {
        matches!(self, DbError::Busy(_) | DbError::PoolExhausted)
    }
}

fn is_lock_contention(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i64>().ok())
        .map(|extended| extended & 0xff)
        .is_some_and(|primary| primary == SQLITE_BUSY || primary == SQLITE_LOCKED)
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Row", "unknown"),

            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                match db_err.kind() {
                    SqlxErrorKind::UniqueViolation => DbError::UniqueViolation {
                        constraint: message
                            .strip_prefix("UNIQUE constraint failed: ")
                            .unwrap_or(&message)
                            .to_string(),
                    },
                    SqlxErrorKind::ForeignKeyViolation => {
                        DbError::ForeignKeyViolation { message }
                    }
                    SqlxErrorKind::CheckViolation => DbError::CheckViolation { message },
                    _ if is_lock_contention(db_err.code().as_deref()) => DbError::Busy(message),
                    _ => DbError::QueryFailed(message),
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool is closed".into()),
            sqlx::Error::ColumnDecode { index, source } => DbError::CorruptRow {
                table: "unknown",
                reason: format!("column {index}: {source}"),
            },
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Stored tags or payload envelopes that no longer parse.
impl From<CoreError> for DbError {
    fn from(err: CoreError) -> Self {
        DbError::corrupt("queue_entries", err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;
