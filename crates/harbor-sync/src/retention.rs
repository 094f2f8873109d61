//! # Retention Worker
//!
//! Scheduled housekeeping, independent of the dispatch cycle.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  run_pass (in order)                                                   │
//! │                                                                         │
//! │  1. reap       Processing longer than stale_after ──► Pending          │
//! │  2. embedded   parent dependency Synced ───────────► Synced            │
//! │  3. vanished   embedded, local record gone ────────► Synced            │
//! │  4. unresolvable dependency skipped/purged ────────► Skipped           │
//! │  5. purge      Synced older than purge_after ──────► deleted           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use harbor_core::EntityType;
use harbor_db::QueueRepository;

use crate::config::RetentionSettings;
use crate::error::SyncResult;

/// Embedded entries checked against local storage per pass.
const EMBEDDED_PROBE_LIMIT: u32 = 500;

/// Answers whether a business record still exists locally.
#[async_trait]
pub trait LocalRecordProbe: Send + Sync {
    async fn exists(&self, entity_type: EntityType, local_record_id: &str) -> SyncResult<bool>;
}

/// What one retention pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub reaped: Vec<i64>,
    pub completed_with_parent: Vec<i64>,
    pub completed_vanished: Vec<i64>,
    pub skipped: Vec<i64>,
    pub purged: u64,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty()
            && self.completed_with_parent.is_empty()
            && self.completed_vanished.is_empty()
            && self.skipped.is_empty()
            && self.purged == 0
    }
}

pub struct RetentionWorker {
    queue: QueueRepository,
    probe: Option<Arc<dyn LocalRecordProbe>>,
    settings: RetentionSettings,
}

impl RetentionWorker {
    pub fn new(queue: QueueRepository, settings: RetentionSettings) -> Self {
        RetentionWorker {
            queue,
            probe: None,
            settings,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LocalRecordProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Runs passes on the retention interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.interval_secs,
            stale_after_secs = self.settings.stale_after_secs,
            purge_after_days = self.settings.purge_after_days,
            "Retention worker starting"
        );

        let mut interval = tokio::time::interval(self.settings.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_pass().await {
                        error!(error = %e, "Retention pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Retention worker stopped");
    }

    pub async fn run_pass(&self) -> SyncResult<RetentionReport> {
        let mut report = RetentionReport {
            reaped: self
                .queue
                .reap_stuck_processing(self.settings.stale_after())
                .await?,
            completed_with_parent: self.queue.complete_embedded_with_parent().await?,
            ..RetentionReport::default()
        };
        report.completed_vanished = self.complete_vanished().await?;
        report.skipped = self.queue.skip_unresolvable().await?;
        report.purged = self.queue.purge_synced(self.settings.purge_after()).await?;

        if !report.is_empty() {
            info!(
                reaped = report.reaped.len(),
                completed_with_parent = report.completed_with_parent.len(),
                completed_vanished = report.completed_vanished.len(),
                skipped = report.skipped.len(),
                purged = report.purged,
                "Retention pass complete"
            );
        }
        Ok(report)
    }

    /// Embedded entries whose local record is gone never travel with a
    /// parent; they are done.
    async fn complete_vanished(&self) -> SyncResult<Vec<i64>> {
        let Some(probe) = &self.probe else {
            return Ok(Vec::new());
        };

        let mut done = Vec::new();
        for entry in self.queue.active_embedded(EMBEDDED_PROBE_LIMIT).await? {
            match probe.exists(entry.entity_type, &entry.local_record_id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.queue
                        .complete_without_dispatch(entry.id, "local record no longer exists")
                        .await?;
                    done.push(entry.id);
                }
                Err(e) => {
                    warn!(entry_id = entry.id, error = %e, "Local record probe failed");
                }
            }
        }
        Ok(done)
    }
}
