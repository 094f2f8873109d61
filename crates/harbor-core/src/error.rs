//! # Error Types
//!
//! Domain-specific error types for harbor-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  harbor-core errors (this file)                                        │
//! │  ├── CoreError      - State machine and payload errors                 │
//! │  └── SnapshotError  - Building a payload from a business record        │
//! │                                                                         │
//! │  harbor-db errors (separate crate)                                     │
//! │  └── DbError        - Queue store failures                             │
//! │                                                                         │
//! │  harbor-sync errors (separate crate)                                   │
//! │  └── SyncError      - Transport, config, reconciliation                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::EntryState;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A queue entry was asked to move along an edge the state machine forbids.
    ///
    /// ## When This Occurs
    /// - Marking a `Synced` entry as errored
    /// - Skipping an entry that is currently `Processing`
    /// - Resetting a terminal entry
    #[error("Invalid queue transition: {from} -> {to}")]
    InvalidTransition { from: EntryState, to: EntryState },

    /// A stored tag does not name a known variant.
    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    /// The payload envelope uses a version this build cannot read.
    #[error("Unsupported payload version {found} (max supported {supported})")]
    UnsupportedPayloadVersion { found: u32, supported: u32 },

    /// Payload body could not be (de)serialized.
    #[error("Payload serialization failed: {0}")]
    PayloadSerialization(String),

    /// Building the payload snapshot failed.
    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),
}

// =============================================================================
// Snapshot Error
// =============================================================================

/// Errors raised while turning a business record into a queue payload.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The source record disappeared between the mutation and the snapshot.
    #[error("{entity_type} record {local_id} no longer exists")]
    RecordVanished {
        entity_type: String,
        local_id: String,
    },

    /// The record exists but cannot be serialized.
    #[error("Cannot serialize {entity_type} record {local_id}: {reason}")]
    Unserializable {
        entity_type: String,
        local_id: String,
        reason: String,
    },
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::PayloadSerialization(err.to_string())
    }
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
