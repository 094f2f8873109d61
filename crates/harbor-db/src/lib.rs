//! # harbor-db: Queue Store for Harbor Sync
//!
//! Durable SQLite storage for the offline replication queue. Everything the
//! engine must remember across a restart lives here; nothing is kept only
//! in memory.
//!
//! ## Tables and Their Owners
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  QueueRepository                                                        │
//! │   ├── queue_entries          one row per unit of replication work      │
//! │   │     partial UNIQUE (type, record, partition) over active states    │
//! │   ├── queue_dependencies     entry ──► lower entry id it waits for     │
//! │   └── queue_attempts         append-only history for operators         │
//! │                                                                         │
//! │  IdentityRepository                                                     │
//! │   └── remote_identity_mappings  local record ──► remote id + keys      │
//! │                                                                         │
//! │  BindingRepository                                                      │
//! │   └── partition_bindings     branch ──► partition key + endpoint       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            ▲ one SqlitePool (WAL, foreign keys on), see [`pool`]
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Opening the store, repository accessors
//! - [`migrations`] - Embedded schema migrations
//! - [`error`] - `DbError` and sqlx error classification
//! - [`repository`] - Queue, identity and binding repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harbor_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("queue.db")).await?;
//! let batch = db.queue().claim_batch(&partition, 20).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::binding::{BindingRepository, PartitionBinding};
pub use repository::identity::IdentityRepository;
pub use repository::queue::{
    Enqueued, EntryFilter, Failure, NewEntry, QueueRepository, RetrySchedule, StateCount,
    SyncedOutcome,
};
