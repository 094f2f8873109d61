//! # harbor-core: Domain Types for the Offline Sync Queue
//!
//! Pure types and rules for replicating branch POS records to the central
//! system. Nothing in this crate touches a database or the network.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Harbor Sync Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 POS write paths (orders, partners)              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ notify_mutated                         │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          harbor-sync (gateway, workers, reconciler)             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ harbor-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  records  │  │ identity  │  │  backoff  │  │   │
//! │  │   │QueueEntry │  │SyncRecord │  │  Probe    │  │ retry     │  │   │
//! │  │   │EntryState │  │ snapshots │  │ Mapping   │  │ schedule  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 harbor-db (SQLite queue store)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Queue entry, state machine, priorities, payload envelope
//! - [`records`] - The [`SyncRecord`] trait and the synchronized business snapshots
//! - [`identity`] - Identity probes and remote mappings
//! - [`backoff`] - Retry delay schedule
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use harbor_core::types::{EntryState, Operation};
//!
//! // A pending create absorbs later updates.
//! assert_eq!(Operation::coalesce(Operation::Create, Operation::Update), Operation::Create);
//!
//! // Terminal states never move.
//! assert!(!EntryState::Synced.can_transition_to(EntryState::Pending));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backoff;
pub mod error;
pub mod identity;
pub mod records;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{CoreError, CoreResult, SnapshotError};
pub use identity::{IdentityProbe, MatchedBy, RemoteIdentityMapping};
pub use records::{
    AuxiliaryDocumentRecord, OrderLine, OrderRecord, OrderStatus, PartnerRecord, RecordRef,
    SyncRecord,
};
pub use types::{
    AttemptOutcome, AttemptRecord, EntityType, EntryState, ErrorKind, Operation, PartitionKey,
    Payload, Priority, QueueEntry, CURRENT_PAYLOAD_VERSION,
};
