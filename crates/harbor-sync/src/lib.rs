//! # harbor-sync: Sync Engine for Harbor POS
//!
//! Replicates locally committed branch records to the central system,
//! offline-first: every mutation is queued durably and drained when the
//! central endpoint is reachable.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  POS write path ──► SyncGateway.notify_mutated ──► queue_entries       │
//! │                       (partition via BindingResolver + TtlCache)       │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncAgent (Main Orchestrator)               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ DispatchWorker │  │RemoteReconciler│  │  RetentionWorker       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Claims a batch │  │ Business key,  │  │ Reaps stuck entries,   │    │
//! │  │ per partition, │  │ stored mapping,│  │ completes embedded,    │    │
//! │  │ submits, marks │  │ legacy id,     │  │ skips unresolvable,    │    │
//! │  │ outcomes       │  │ natural key    │  │ purges synced          │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          └──────────┬────────┘                                          │
//! │                     ▼                                                   │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  SyncTransport + RemoteDirectory  (WsTransport: JSON over WS)    │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  Operator: list / show / retry / skip / summary                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - `SyncAgent` orchestrator and builder
//! - [`cache`] - TTL cache with explicit invalidation
//! - [`config`] - Layered configuration (defaults, TOML, environment)
//! - [`error`] - Sync error types
//! - [`gateway`] - Enqueue gateway and partition resolution
//! - [`operator`] - Operator queries and actions
//! - [`protocol`] - Wire messages for the central endpoint
//! - [`reconciler`] - Remote identity matching, outgoing and inbound
//! - [`retention`] - Reaper, embedded completion, purge
//! - [`transport`] - Transport traits and the WebSocket client
//! - [`worker`] - Claim-and-dispatch worker
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harbor_sync::{SyncAgent, SyncConfig, SyncContext};
//! use harbor_core::Operation;
//!
//! let config = SyncConfig::load(None)?;
//! let mut agent = SyncAgent::builder(config).with_database(db).build()?;
//! agent.start().await?;
//!
//! // After the order transaction commits:
//! agent.gateway().notify_mutated(SyncContext::normal(), Operation::Update, &order).await?;
//! agent.trigger_now();
//!
//! let status = agent.status().await?;
//! println!("Outstanding: {}", status.queue.outstanding());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod operator;
pub mod protocol;
pub mod reconciler;
pub mod retention;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{SyncAgent, SyncAgentBuilder, SyncStatus};
pub use cache::TtlCache;
pub use config::{PartitionSettings, SyncConfig};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use gateway::{BindingResolver, EnqueueOutcome, SyncContext, SyncGateway};
pub use operator::{EntryDetail, Operator, PartitionSummary, QueueSummary};
pub use protocol::SyncMessage;
pub use reconciler::{InboundDecision, RemoteReconciler, Resolution};
pub use retention::{LocalRecordProbe, RetentionReport, RetentionWorker};
pub use transport::{
    RemoteDirectory, Submission, SubmitOutcome, SubmitResult, SyncTransport, WsTransport,
};
pub use worker::{CycleReport, DispatchWorker, SyncBookkeeping};
