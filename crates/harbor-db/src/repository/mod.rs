//! # Repository Module
//!
//! Repository implementations for the queue store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Gateway / Worker / Operator                                           │
//! │       │                                                                 │
//! │       │  db.queue().claim_batch(&partition, 20)                        │
//! │       ▼                                                                 │
//! │  QueueRepository                                                       │
//! │  ├── enqueue(&self, entry)          coalescing upsert                  │
//! │  ├── claim_batch(&self, p, n)       atomic claim                       │
//! │  ├── mark_synced / mark_error       dispatch outcomes                  │
//! │  └── reap / purge / skip_unresolvable                                  │
//! │       │                                                                 │
//! │       │  SQL                                                            │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`QueueRepository`](queue::QueueRepository) - Queue entries, dependencies, attempt history
//! - [`IdentityRepository`](identity::IdentityRepository) - Remote identity mappings
//! - [`BindingRepository`](binding::BindingRepository) - Branch to partition bindings

pub mod binding;
pub mod identity;
pub mod queue;
