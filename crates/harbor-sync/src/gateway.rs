//! # Enqueue Gateway
//!
//! Turns a committed local mutation into a queue entry. Each business entity
//! calls [`SyncGateway::notify_mutated`] from its own write path, after the
//! local transaction commits.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  notify_mutated(ctx, op, &record)                                      │
//! │       │                                                                 │
//! │       ├── ctx suppressed (import, inbound apply) ──► Suppressed        │
//! │       │                                                                 │
//! │       ├── branch ─► BindingResolver (TTL cache ─► partition_bindings)  │
//! │       │      └── no binding ───────────────────────► Unpartitioned     │
//! │       │                                                                 │
//! │       ├── snapshot ── fails ─► skip active entries ─► Skipped          │
//! │       │                                                                 │
//! │       ├── dependencies: referenced records with an active entry        │
//! │       │   (embedded types with no active parent entry wait for the     │
//! │       │   parent's next entry, which links them on enqueue)            │
//! │       │                                                                 │
//! │       └── QueueRepository::enqueue (coalescing) ──────► Queued         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};

use harbor_core::{
    EntityType, EntryState, ErrorKind, Operation, PartitionKey, RecordRef, SnapshotError,
    SyncRecord,
};
use harbor_db::{BindingRepository, Enqueued, NewEntry, PartitionBinding, QueueRepository};

use crate::cache::TtlCache;
use crate::config::PartitionSettings;
use crate::error::SyncResult;

// =============================================================================
// Sync Context
// =============================================================================

/// Whether mutations made under this context replicate.
///
/// Bulk imports, migrations and writes that apply data received from the
/// central system run suppressed so nothing is echoed back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncContext {
    suppressed: bool,
}

impl SyncContext {
    pub fn normal() -> Self {
        SyncContext { suppressed: false }
    }

    pub fn suppressed() -> Self {
        SyncContext { suppressed: true }
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }
}

// =============================================================================
// Binding Resolver
// =============================================================================

/// Resolves a branch to its partition binding through a TTL cache.
pub struct BindingResolver {
    bindings: BindingRepository,
    cache: TtlCache<String, Option<PartitionBinding>>,
}

impl BindingResolver {
    pub fn new(bindings: BindingRepository, ttl: std::time::Duration) -> Self {
        BindingResolver {
            bindings,
            cache: TtlCache::new(ttl),
        }
    }

    /// Active binding for a branch. Misses are cached too.
    pub async fn resolve(&self, branch_id: &str) -> SyncResult<Option<PartitionBinding>> {
        let key = branch_id.to_string();
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }
        let binding = self.bindings.active_for_branch(branch_id).await?;
        self.cache.insert(key, binding.clone()).await;
        Ok(binding)
    }

    /// Stores the configured bindings and drops everything cached.
    pub async fn seed(&self, partitions: &[PartitionSettings]) -> SyncResult<()> {
        for p in partitions {
            self.bindings
                .upsert(&p.branch_id, &p.partition_key(), &p.endpoint)
                .await?;
        }
        self.cache.clear().await;
        info!(count = partitions.len(), "Partition bindings seeded");
        Ok(())
    }

    pub async fn invalidate(&self, branch_id: &str) {
        self.cache.invalidate(&branch_id.to_string()).await;
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Result of a mutation notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(Enqueued),
    /// The context asked for no replication.
    Suppressed,
    /// The record's branch has no active partition; nothing queued.
    Unpartitioned,
    /// The snapshot could not be built; these active entries were skipped.
    Skipped { entry_ids: Vec<i64> },
}

pub struct SyncGateway {
    queue: QueueRepository,
    resolver: Arc<BindingResolver>,
    max_attempts: u32,
}

impl SyncGateway {
    pub fn new(queue: QueueRepository, resolver: Arc<BindingResolver>, max_attempts: u32) -> Self {
        SyncGateway {
            queue,
            resolver,
            max_attempts,
        }
    }

    pub fn resolver(&self) -> &Arc<BindingResolver> {
        &self.resolver
    }

    /// Queues a mutation of `record`.
    pub async fn notify_mutated<R: SyncRecord>(
        &self,
        ctx: SyncContext,
        operation: Operation,
        record: &R,
    ) -> SyncResult<EnqueueOutcome> {
        if ctx.is_suppressed() {
            debug!(entity_type = %R::ENTITY_TYPE, local_record_id = %record.local_id(), "Sync suppressed");
            return Ok(EnqueueOutcome::Suppressed);
        }

        let local_id = record.local_id();
        let Some(branch_id) = record.branch_id() else {
            debug!(entity_type = %R::ENTITY_TYPE, local_record_id = %local_id, "No branch; not queued");
            return Ok(EnqueueOutcome::Unpartitioned);
        };
        let Some(binding) = self.resolver.resolve(branch_id).await? else {
            debug!(
                entity_type = %R::ENTITY_TYPE,
                local_record_id = %local_id,
                branch_id,
                "Branch has no partition; not queued"
            );
            return Ok(EnqueueOutcome::Unpartitioned);
        };

        let payload = match record.snapshot() {
            Ok(payload) => payload,
            Err(e) => return self.skip_unbuildable(R::ENTITY_TYPE, &local_id, &e).await,
        };

        let references = record.references();
        let depends_on = self.dependencies(&references, &binding.partition).await?;
        let parent_record_id = R::ENTITY_TYPE.embedded_in().and_then(|parent| {
            references
                .iter()
                .find(|r| r.entity_type == parent)
                .map(|r| r.local_id.clone())
        });

        let enqueued = self
            .queue
            .enqueue(NewEntry {
                entity_type: R::ENTITY_TYPE,
                local_record_id: local_id,
                human_reference: record.human_reference(),
                operation,
                payload,
                target_partition: binding.partition,
                priority: record.priority(),
                depends_on,
                identity: record.identity(),
                parent_record_id,
                max_attempts: self.max_attempts,
            })
            .await?;
        Ok(EnqueueOutcome::Queued(enqueued))
    }

    /// Like [`notify_mutated`](Self::notify_mutated), but reloads the record
    /// first. A record that can no longer be loaded skips its active entries.
    pub async fn notify_mutated_with<R, F>(
        &self,
        ctx: SyncContext,
        operation: Operation,
        local_record_id: &str,
        load: F,
    ) -> SyncResult<EnqueueOutcome>
    where
        R: SyncRecord,
        F: FnOnce() -> Result<R, SnapshotError>,
    {
        if ctx.is_suppressed() {
            return Ok(EnqueueOutcome::Suppressed);
        }
        match load() {
            Ok(record) => self.notify_mutated(ctx, operation, &record).await,
            Err(e) => self.skip_unbuildable(R::ENTITY_TYPE, local_record_id, &e).await,
        }
    }

    /// Entries this record must wait for.
    ///
    /// A referenced record with an active entry in the same partition is a
    /// dependency; one already synced (no active entry) is not. For an
    /// embedded type that means an already-synced parent is no dependency
    /// at all: the entry waits until the parent's next entry picks it up.
    async fn dependencies(
        &self,
        references: &[RecordRef],
        partition: &PartitionKey,
    ) -> SyncResult<Vec<i64>> {
        let mut deps = Vec::new();
        for reference in references {
            if let Some(target) = self
                .queue
                .find_active(reference.entity_type, &reference.local_id, partition)
                .await?
            {
                deps.push(target.id);
            }
        }
        deps.sort_unstable();
        deps.dedup();
        Ok(deps)
    }

    async fn skip_unbuildable(
        &self,
        entity_type: EntityType,
        local_record_id: &str,
        error: &SnapshotError,
    ) -> SyncResult<EnqueueOutcome> {
        warn!(
            entity_type = %entity_type,
            local_record_id,
            error = %error,
            "Cannot build snapshot; skipping active entries"
        );

        let mut entry_ids = Vec::new();
        for entry in self
            .queue
            .find_active_for_record(entity_type, local_record_id)
            .await?
        {
            // A claimed entry still holds its last good payload; let it finish.
            if entry.state == EntryState::Processing {
                continue;
            }
            self.queue
                .skip(entry.id, ErrorKind::Integrity, &error.to_string())
                .await?;
            entry_ids.push(entry.id);
        }
        Ok(EnqueueOutcome::Skipped { entry_ids })
    }
}
