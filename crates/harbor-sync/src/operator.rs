//! # Operator Surface
//!
//! What a support operator can see and do with the queue: list stuck
//! entries, read an entry's attempt history, force a retry or a skip.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use harbor_core::{AttemptRecord, EntryState, ErrorKind, PartitionKey, QueueEntry};
use harbor_db::{EntryFilter, QueueRepository};

use crate::error::SyncResult;

/// One entry with everything needed to decide what to do about it.
#[derive(Debug, Clone, Serialize)]
pub struct EntryDetail {
    pub entry: QueueEntry,
    pub attempts: Vec<AttemptRecord>,
    pub remaining_attempts: u32,
    /// Automatic retries exhausted; only a retry from here moves it.
    pub frozen: bool,
}

/// Entry counts for one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionSummary {
    pub partition: String,
    pub pending: i64,
    pub processing: i64,
    pub error: i64,
    pub synced: i64,
    pub skipped: i64,
}

impl PartitionSummary {
    fn add(&mut self, state: EntryState, count: i64) {
        match state {
            EntryState::Pending => self.pending += count,
            EntryState::Processing => self.processing += count,
            EntryState::Error => self.error += count,
            EntryState::Synced => self.synced += count,
            EntryState::Skipped => self.skipped += count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub partitions: Vec<PartitionSummary>,
    /// Entries in `Error` with no attempts left, across all partitions.
    pub frozen: i64,
}

impl QueueSummary {
    /// Entries still to be replicated (pending, processing or error).
    pub fn outstanding(&self) -> i64 {
        self.partitions
            .iter()
            .map(|p| p.pending + p.processing + p.error)
            .sum()
    }

    pub fn partition(&self, key: &PartitionKey) -> Option<&PartitionSummary> {
        self.partitions.iter().find(|p| p.partition == key.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Operator {
    queue: QueueRepository,
}

impl Operator {
    pub fn new(queue: QueueRepository) -> Self {
        Operator { queue }
    }

    pub async fn list(&self, filter: &EntryFilter) -> SyncResult<Vec<QueueEntry>> {
        Ok(self.queue.list(filter).await?)
    }

    pub async fn show(&self, id: i64) -> SyncResult<EntryDetail> {
        let entry = self.queue.get_required(id).await?;
        let attempts = self.queue.attempts(id).await?;
        Ok(EntryDetail {
            remaining_attempts: entry.remaining_attempts(),
            frozen: entry.is_frozen(),
            entry,
            attempts,
        })
    }

    /// Force-retry: back to `Pending` with a fresh attempt budget.
    pub async fn retry(&self, id: i64) -> SyncResult<()> {
        self.queue.reset_to_pending(id).await?;
        info!(entry_id = id, "Operator retry");
        Ok(())
    }

    /// Force-skip: the entry will never replicate.
    pub async fn skip(&self, id: i64, reason: &str) -> SyncResult<()> {
        self.queue.skip(id, ErrorKind::Operator, reason).await?;
        info!(entry_id = id, reason, "Operator skip");
        Ok(())
    }

    pub async fn summary(&self) -> SyncResult<QueueSummary> {
        let mut partitions: BTreeMap<String, PartitionSummary> = BTreeMap::new();
        for count in self.queue.count_by_state().await? {
            let key = count.partition.as_str().to_string();
            partitions
                .entry(key.clone())
                .or_insert_with(|| PartitionSummary {
                    partition: key,
                    ..PartitionSummary::default()
                })
                .add(count.state, count.count);
        }

        Ok(QueueSummary {
            partitions: partitions.into_values().collect(),
            frozen: self.queue.count_frozen().await?,
        })
    }

    pub async fn reap(&self, stale_after: chrono::Duration) -> SyncResult<Vec<i64>> {
        Ok(self.queue.reap_stuck_processing(stale_after).await?)
    }

    pub async fn purge(&self, older_than: chrono::Duration) -> SyncResult<u64> {
        Ok(self.queue.purge_synced(older_than).await?)
    }
}
