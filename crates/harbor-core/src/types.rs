//! # Domain Types
//!
//! Core queue types used throughout the sync engine.
//!
//! ## Queue Entry Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Queue Entry State Machine                          │
//! │                                                                         │
//! │              claim                ack                                   │
//! │  ┌─────────┐ ─────► ┌────────────┐ ────► ┌────────┐                     │
//! │  │ Pending │        │ Processing │       │ Synced │  (terminal)         │
//! │  └─────────┘ ◄───── └────────────┘       └────────┘                     │
//! │    ▲  │      reap /       │                   ▲                         │
//! │    │  │      requeue      │ failure           │ parent synced           │
//! │    │  │                   ▼                   │ (embedded types)        │
//! │    │  │              ┌─────────┐ ─────────────┘                         │
//! │    │  │              │  Error  │ ──── claim after nextRetryAt ───►      │
//! │    │  │              └─────────┘                                        │
//! │    └──┼── reset ──────────┘  │                                          │
//! │       │                      │                                          │
//! │       └──── skip ──► ┌─────────┐ ◄──── skip / unreadable payload        │
//! │                      │ Skipped │  (terminal)                            │
//! │                      └─────────┘                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityProbe;

// =============================================================================
// Entity Type
// =============================================================================

/// The closed set of business-entity kinds the queue replicates.
///
/// Each variant carries its own declarative sync properties so no code path
/// has to special-case a type by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A point-of-sale order.
    Order,
    /// A customer or supplier record.
    Partner,
    /// Auxiliary payment artifact (card slip, voucher) attached to an order.
    AuxiliaryDocument,
}

impl EntityType {
    /// Every variant, in a stable order.
    pub const ALL: [EntityType; 3] = [
        EntityType::Order,
        EntityType::Partner,
        EntityType::AuxiliaryDocument,
    ];

    /// Stable storage/wire tag.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityType::Order => "order",
            EntityType::Partner => "partner",
            EntityType::AuxiliaryDocument => "auxiliary_document",
        }
    }

    /// The parent type this entity is replicated inside of, if any.
    ///
    /// Entries of an embedded type are never dispatched on their own. They
    /// complete when their parent entry reaches `Synced`.
    pub const fn embedded_in(&self) -> Option<EntityType> {
        match self {
            EntityType::AuxiliaryDocument => Some(EntityType::Order),
            EntityType::Order | EntityType::Partner => None,
        }
    }

    /// Returns true if the dispatch worker sends this type independently.
    pub const fn is_dispatchable(&self) -> bool {
        self.embedded_in().is_none()
    }

    /// Types that the dispatch worker may claim.
    pub fn dispatchable() -> impl Iterator<Item = EntityType> {
        Self::ALL.into_iter().filter(|t| t.is_dispatchable())
    }

    /// Types that only replicate as part of a parent.
    pub fn embedded() -> impl Iterator<Item = EntityType> {
        Self::ALL.into_iter().filter(|t| !t.is_dispatchable())
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "order" => Ok(EntityType::Order),
            "partner" | "customer" => Ok(EntityType::Partner),
            "auxiliary_document" | "auxiliarydocument" => Ok(EntityType::AuxiliaryDocument),
            _ => Err(CoreError::UnknownVariant {
                kind: "entity type",
                value: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Operation
// =============================================================================

/// The mutation a queue entry replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Merges an incoming mutation into the operation of a still-pending entry.
    ///
    /// The remote has never seen a pending `Create`, so a later `Update` must
    /// still be sent as a creation. Every other pair takes the newer operation.
    pub fn coalesce(existing: Operation, incoming: Operation) -> Operation {
        match (existing, incoming) {
            (Operation::Create, Operation::Update) => Operation::Create,
            (_, newer) => newer,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Entry State
// =============================================================================

/// Replication state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Pending,
    Processing,
    Synced,
    Error,
    Skipped,
}

impl EntryState {
    pub const ALL: [EntryState; 5] = [
        EntryState::Pending,
        EntryState::Processing,
        EntryState::Synced,
        EntryState::Error,
        EntryState::Skipped,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Processing => "processing",
            EntryState::Synced => "synced",
            EntryState::Error => "error",
            EntryState::Skipped => "skipped",
        }
    }

    /// `Synced` and `Skipped` never change again.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Synced | EntryState::Skipped)
    }

    /// Returns true if the state machine allows `self -> to`.
    ///
    /// `Pending/Error -> Synced` is reserved for entries completed without
    /// their own dispatch (embedded types whose parent replicated).
    /// `Processing -> Skipped` only happens when the worker finds the payload
    /// unreadable; operators can skip `Pending` and `Error` entries only.
    pub const fn can_transition_to(&self, to: EntryState) -> bool {
        use EntryState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Error, Processing)
                | (Processing, Synced)
                | (Processing, Error)
                | (Processing, Pending)
                | (Pending, Pending)
                | (Error, Pending)
                | (Pending, Skipped)
                | (Error, Skipped)
                | (Processing, Skipped)
                | (Pending, Synced)
                | (Error, Synced)
        )
    }

    /// Validates a transition, returning the target state.
    pub fn transition(self, to: EntryState) -> CoreResult<EntryState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(CoreError::InvalidTransition { from: self, to })
        }
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryState::ALL
            .into_iter()
            .find(|state| state.as_str() == s.to_lowercase())
            .ok_or_else(|| CoreError::UnknownVariant {
                kind: "entry state",
                value: s.to_string(),
            })
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Drain tier within a partition. Higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Integer rank stored in the queue (sortable).
    pub const fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 10,
            Priority::High => 20,
        }
    }

    /// Maps a stored rank back to the nearest tier.
    pub const fn from_rank(rank: i64) -> Self {
        if rank >= 20 {
            Priority::High
        } else if rank >= 10 {
            Priority::Normal
        } else {
            Priority::Low
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

// =============================================================================
// Error Kind
// =============================================================================

/// Category of the most recent failure on an entry (diagnostic only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Timeout, refused connection, broken socket.
    Transport,
    /// Remote validation refused the record.
    Rejected,
    /// A dependency was purged, deleted or skipped before syncing.
    Dependency,
    /// The local payload could not be read or rebuilt.
    Integrity,
    /// Identity lookup against the remote failed.
    Reconcile,
    /// Set aside by an operator.
    Operator,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Reconcile => "reconcile",
            ErrorKind::Operator => "operator",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Partition
// =============================================================================

/// Remote endpoint/context an entry replicates to (branch + cloud binding).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        PartitionKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(s: &str) -> Self {
        PartitionKey(s.to_string())
    }
}

impl From<String> for PartitionKey {
    fn from(s: String) -> Self {
        PartitionKey(s)
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Highest payload envelope version this build produces and reads.
pub const CURRENT_PAYLOAD_VERSION: u32 = 1;

/// Versioned, immutable snapshot of a record at enqueue time.
///
/// Coalescing replaces the whole payload; it is never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub version: u32,
    pub body: serde_json::Value,
}

impl Payload {
    /// Wraps an already-serialized body at the current version.
    pub fn new(body: serde_json::Value) -> Self {
        Payload {
            version: CURRENT_PAYLOAD_VERSION,
            body,
        }
    }

    /// Serializes a record into a payload.
    pub fn encode<T: Serialize>(record: &T) -> CoreResult<Self> {
        Ok(Payload::new(serde_json::to_value(record)?))
    }

    /// Fails if the envelope was written by a newer build.
    pub fn check_version(&self) -> CoreResult<()> {
        if self.version == 0 || self.version > CURRENT_PAYLOAD_VERSION {
            return Err(CoreError::UnsupportedPayloadVersion {
                found: self.version,
                supported: CURRENT_PAYLOAD_VERSION,
            });
        }
        Ok(())
    }

    /// Reads the body back as a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        self.check_version()?;
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

// =============================================================================
// Queue Entry
// =============================================================================

/// The unit of replication work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub entity_type: EntityType,
    pub local_record_id: String,
    /// Display string for operators. Not a key.
    pub human_reference: String,
    pub operation: Operation,
    pub payload: Payload,
    /// Bumped every time a mutation coalesces into this entry.
    pub payload_revision: i64,
    pub target_partition: PartitionKey,
    pub priority: Priority,
    pub state: EntryState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Entries that must reach `Synced` before this one is eligible.
    pub depends_on: Vec<i64>,
    pub remote_record_id: Option<String>,
    pub identity: IdentityProbe,
    /// Embedded types only: the parent record this entry travels with.
    pub parent_record_id: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub last_response_snapshot: Option<String>,
    /// Set while `Processing`. Every outcome must present it.
    pub claim_token: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Attempts left before the entry freezes in `Error`.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// True when automatic retries are exhausted and an operator must reset.
    pub fn is_frozen(&self) -> bool {
        self.state == EntryState::Error && self.attempt_count >= self.max_attempts
    }

    /// True when `claimBatch` could pick this entry up at `now`
    /// (ignoring dependencies, which live in the store).
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, EntryState::Pending | EntryState::Error)
            && self.attempt_count < self.max_attempts
            && self.next_retry_at.map_or(true, |at| at <= now)
            && self.entity_type.is_dispatchable()
    }
}

// =============================================================================
// Attempt History
// =============================================================================

/// What happened on one recorded step of an entry's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Acked,
    Rejected,
    TransportError,
    Skipped,
    Reset,
    Reaped,
    Requeued,
    CompletedWithParent,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptOutcome::Acked => "acked",
            AttemptOutcome::Rejected => "rejected",
            AttemptOutcome::TransportError => "transport_error",
            AttemptOutcome::Skipped => "skipped",
            AttemptOutcome::Reset => "reset",
            AttemptOutcome::Reaped => "reaped",
            AttemptOutcome::Requeued => "requeued",
            AttemptOutcome::CompletedWithParent => "completed_with_parent",
        };
        f.write_str(s)
    }
}

/// A row of an entry's attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub entry_id: i64,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================
