//! # Claim-and-Dispatch Worker
//!
//! Drives the entries of one partition to the central system. Several
//! workers may serve the same partition; the atomic claim keeps their
//! batches disjoint.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        DispatchWorker Cycle                             │
//! │                                                                         │
//! │  1. claim_batch(partition, batch_size)                                 │
//! │       priority DESC, age ASC, dependencies already synced              │
//! │                                                                         │
//! │  2. For each entry, in claim order:                                    │
//! │       payload version unreadable ──► Skipped (integrity)               │
//! │       reconciler.resolve ── fails ─► Error   (reconcile)               │
//! │       Delete with no counterpart ──► Synced  (nothing to send)         │
//! │       submit (bounded by transport timeout)                            │
//! │         Ack(remote) ───► record mapping ─► Synced ─► bookkeeping       │
//! │         Rejected ──────► Error (rejected, consumes an attempt)         │
//! │         TransportError ► Error (transport)                             │
//! │                                                                         │
//! │  3. A failure only ever affects its own entry.                         │
//! │                                                                         │
//! │  Every outcome presents the entry's claim token. If the reaper took    │
//! │  the entry back meanwhile, the outcome is dropped (ClaimLost).         │
//! │  On shutdown the rest of the batch is released back to Pending.        │
//! │                                                                         │
//! │  TIMING:                                                               │
//! │  • Poll interval: 10 seconds (configurable)                            │
//! │  • Full batch: next cycle starts immediately                           │
//! │  • trigger_now: wakes idle workers without waiting for the tick        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use harbor_core::{EntityType, ErrorKind, Operation, PartitionKey, QueueEntry};
use harbor_db::{DbError, Failure, QueueRepository, SyncedOutcome};

use crate::config::DispatchSettings;
use crate::error::{SyncError, SyncResult};
use crate::reconciler::{RemoteReconciler, Resolution};
use crate::transport::{Submission, SubmitOutcome, SubmitResult, SyncTransport};

// =============================================================================
// Source Bookkeeping
// =============================================================================

/// Records sync state on the business record itself after an ack.
///
/// Implementations must be idempotent; a failure is logged and never
/// affects the queue entry.
#[async_trait]
pub trait SyncBookkeeping: Send + Sync {
    async fn record_synced(
        &self,
        entity_type: EntityType,
        local_record_id: &str,
        remote_record_id: Option<&str>,
        synced_at: DateTime<Utc>,
    ) -> SyncResult<()>;
}

// =============================================================================
// Cycle Report
// =============================================================================

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub synced: usize,
    /// Acknowledged, but a newer payload arrived in flight.
    pub requeued: usize,
    pub failed: usize,
    /// Failures that exhausted the entry's attempts.
    pub frozen: usize,
    pub skipped: usize,
    /// Handed back unprocessed because the worker is stopping.
    pub released: usize,
}

// =============================================================================
// Dispatch Worker
// =============================================================================

pub struct DispatchWorker {
    partition: PartitionKey,
    endpoint: String,
    queue: QueueRepository,
    reconciler: Arc<RemoteReconciler>,
    transport: Arc<dyn SyncTransport>,
    bookkeeping: Option<Arc<dyn SyncBookkeeping>>,
    batch_size: u32,
    poll_interval: Duration,
    transport_timeout: Duration,
    backoff_cap: chrono::Duration,
}

impl DispatchWorker {
    pub fn new(
        partition: PartitionKey,
        endpoint: impl Into<String>,
        queue: QueueRepository,
        reconciler: Arc<RemoteReconciler>,
        transport: Arc<dyn SyncTransport>,
        settings: &DispatchSettings,
    ) -> Self {
        DispatchWorker {
            partition,
            endpoint: endpoint.into(),
            queue,
            reconciler,
            transport,
            bookkeeping: None,
            batch_size: settings.batch_size,
            poll_interval: settings.poll_interval(),
            transport_timeout: settings.transport_timeout(),
            backoff_cap: settings.backoff_cap(),
        }
    }

    pub fn with_bookkeeping(mut self, bookkeeping: Arc<dyn SyncBookkeeping>) -> Self {
        self.bookkeeping = Some(bookkeeping);
        self
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    /// Runs until `shutdown` flips to true.
    ///
    /// This should be spawned as a background task.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, trigger: Arc<Notify>) {
        info!(partition = %self.partition, endpoint = %self.endpoint, "Dispatch worker starting");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {}
                _ = trigger.notified() => {
                    debug!(partition = %self.partition, "Dispatch triggered");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            self.drain(&shutdown).await;
        }

        info!(partition = %self.partition, "Dispatch worker stopped");
    }

    /// Runs cycles back to back while batches come back full.
    async fn drain(&self, shutdown: &watch::Receiver<bool>) {
        loop {
            match self.cycle(Some(shutdown)).await {
                Ok(report) if report.claimed as u32 >= self.batch_size && !*shutdown.borrow() => {}
                Ok(_) => break,
                Err(e) => {
                    error!(partition = %self.partition, error = %e, "Dispatch cycle failed");
                    break;
                }
            }
        }
    }

    /// Claims one batch and dispatches every entry in it.
    ///
    /// Only the claim itself can fail the cycle; per-entry problems become
    /// state transitions.
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        self.cycle(None).await
    }

    async fn cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> SyncResult<CycleReport> {
        let entries = self.queue.claim_batch(&self.partition, self.batch_size).await?;
        let mut report = CycleReport {
            claimed: entries.len(),
            ..CycleReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        for entry in &entries {
            if shutdown.is_some_and(|s| *s.borrow()) {
                self.release(entry, &mut report).await;
                continue;
            }
            match self.dispatch(entry, &mut report).await {
                Ok(()) => {}
                Err(SyncError::Database(DbError::ClaimLost { .. })) => {
                    warn!(
                        entry_id = entry.id,
                        partition = %self.partition,
                        "Claim lost to the reaper; outcome dropped"
                    );
                }
                Err(e) => {
                    // The entry stays Processing; the reaper hands it back.
                    error!(
                        entry_id = entry.id,
                        partition = %self.partition,
                        error = %e,
                        "Failed to record dispatch outcome"
                    );
                }
            }
        }

        info!(
            partition = %self.partition,
            claimed = report.claimed,
            synced = report.synced,
            requeued = report.requeued,
            failed = report.failed,
            frozen = report.frozen,
            skipped = report.skipped,
            released = report.released,
            "Dispatch cycle complete"
        );
        Ok(report)
    }

    async fn release(&self, entry: &QueueEntry, report: &mut CycleReport) {
        let result = match claim_token(entry) {
            Ok(token) => self
                .queue
                .release(entry.id, token, "worker stopping")
                .await
                .map_err(SyncError::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => report.released += 1,
            Err(e) => warn!(entry_id = entry.id, error = %e, "Could not release claimed entry"),
        }
    }

    async fn dispatch(&self, entry: &QueueEntry, report: &mut CycleReport) -> SyncResult<()> {
        let token = claim_token(entry)?;
        if let Err(e) = entry.payload.check_version() {
            self.queue
                .abandon(entry.id, token, ErrorKind::Integrity, &e.to_string())
                .await?;
            report.skipped += 1;
            return Ok(());
        }

        let resolution = match self.reconciler.resolve(&self.endpoint, entry).await {
            Ok(resolution) => resolution,
            Err(e) => {
                let failure = Failure::new(ErrorKind::Reconcile, e.to_string());
                return self.fail(entry, &failure, report).await;
            }
        };

        if entry.operation == Operation::Delete && resolution == Resolution::New {
            debug!(entry_id = entry.id, "Delete has no remote counterpart");
            let outcome = self
                .queue
                .mark_synced(entry.id, token, None, Some("no remote counterpart to delete"))
                .await?;
            self.count_synced(outcome, report);
            return Ok(());
        }

        let submission = Submission {
            entry_id: entry.id,
            entity_type: entry.entity_type,
            local_record_id: entry.local_record_id.clone(),
            operation: effective_operation(entry.operation, &resolution),
            remote_record_id: resolution.remote_record_id().map(str::to_string),
            revision: entry.payload_revision,
            payload: entry.payload.clone(),
        };
        debug!(
            entry_id = entry.id,
            entity_type = %entry.entity_type,
            operation = %submission.operation,
            attempt = entry.attempt_count + 1,
            "Submitting"
        );

        let result = self.submit(submission).await;
        match result.outcome {
            SubmitOutcome::Ack(remote) => {
                let remote = remote.or_else(|| resolution.remote_record_id().map(str::to_string));
                if entry.operation != Operation::Delete {
                    self.reconciler.record_mapping(entry, remote.as_deref()).await?;
                }
                let outcome = self
                    .queue
                    .mark_synced(entry.id, token, remote.as_deref(), result.response.as_deref())
                    .await?;
                self.count_synced(outcome, report);
                if outcome == SyncedOutcome::Synced {
                    self.record_bookkeeping(entry, remote.as_deref()).await;
                }
                Ok(())
            }
            SubmitOutcome::Rejected(reason) => {
                warn!(entry_id = entry.id, reason = %reason, "Submission rejected");
                let failure = with_response(Failure::new(ErrorKind::Rejected, reason), result.response);
                self.fail(entry, &failure, report).await
            }
            SubmitOutcome::TransportError(reason) => {
                let failure = with_response(Failure::new(ErrorKind::Transport, reason), result.response);
                self.fail(entry, &failure, report).await
            }
        }
    }

    /// One transport call, bounded by the transport timeout.
    async fn submit(&self, submission: Submission) -> SubmitResult {
        let entry_id = submission.entry_id;
        let call = self.transport.submit(&self.endpoint, vec![submission]);

        match tokio::time::timeout(self.transport_timeout, call).await {
            Err(_) => SubmitResult::new(
                entry_id,
                SubmitOutcome::TransportError(format!(
                    "no response within {}s",
                    self.transport_timeout.as_secs()
                )),
            ),
            Ok(Err(e)) => SubmitResult::new(entry_id, SubmitOutcome::TransportError(e.to_string())),
            Ok(Ok(results)) => results
                .into_iter()
                .find(|r| r.entry_id == entry_id)
                .unwrap_or_else(|| {
                    SubmitResult::new(
                        entry_id,
                        SubmitOutcome::TransportError("no result for entry".into()),
                    )
                }),
        }
    }

    async fn fail(
        &self,
        entry: &QueueEntry,
        failure: &Failure,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let schedule = self
            .queue
            .mark_error(entry.id, claim_token(entry)?, failure, self.backoff_cap)
            .await?;
        report.failed += 1;
        if schedule.is_frozen() {
            report.frozen += 1;
            warn!(
                entry_id = entry.id,
                entity_type = %entry.entity_type,
                kind = %failure.kind,
                attempt = schedule.attempt_count,
                "Attempts exhausted; waiting for operator"
            );
        } else {
            debug!(
                entry_id = entry.id,
                kind = %failure.kind,
                attempt = schedule.attempt_count,
                next_retry_at = %schedule.next_retry_at,
                "Dispatch failed; retry scheduled"
            );
        }
        Ok(())
    }

    fn count_synced(&self, outcome: SyncedOutcome, report: &mut CycleReport) {
        match outcome {
            SyncedOutcome::Synced => report.synced += 1,
            SyncedOutcome::Requeued => report.requeued += 1,
        }
    }

    async fn record_bookkeeping(&self, entry: &QueueEntry, remote: Option<&str>) {
        let Some(bookkeeping) = &self.bookkeeping else {
            return;
        };
        if let Err(e) = bookkeeping
            .record_synced(entry.entity_type, &entry.local_record_id, remote, Utc::now())
            .await
        {
            warn!(
                entry_id = entry.id,
                local_record_id = %entry.local_record_id,
                error = %e,
                "Source bookkeeping failed"
            );
        }
    }
}

fn claim_token(entry: &QueueEntry) -> SyncResult<&str> {
    entry
        .claim_token
        .as_deref()
        .ok_or_else(|| SyncError::Internal(format!("entry {} was not claimed", entry.id)))
}

/// The operation actually sent, given what the remote already has.
fn effective_operation(queued: Operation, resolution: &Resolution) -> Operation {
    match (queued, resolution) {
        (Operation::Delete, _) => Operation::Delete,
        (_, Resolution::Matched { .. }) => Operation::Update,
        (_, Resolution::New) => Operation::Create,
    }
}

fn with_response(failure: Failure, response: Option<String>) -> Failure {
    match response {
        Some(r) => failure.with_response(r),
        None => failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionSettings;
    use crate::gateway::{BindingResolver, EnqueueOutcome, SyncContext, SyncGateway};
    use crate::testing::FakeCentral;
    use harbor_core::{
        EntryState, IdentityProbe, OrderRecord, OrderStatus, PartnerRecord, Payload, Priority,
    };
    use harbor_db::{Database, DbConfig, NewEntry};
    use std::sync::Mutex;

    const ENDPOINT: &str = "wss://sync.example.com/lisbon";

    struct Fixture {
        db: Database,
        central: Arc<FakeCentral>,
        gateway: SyncGateway,
        settings: DispatchSettings,
    }

    impl Fixture {
        fn worker(&self) -> DispatchWorker {
            let reconciler = Arc::new(RemoteReconciler::new(
                self.db.identities(),
                self.db.queue(),
                self.central.clone(),
            ));
            DispatchWorker::new(
                PartitionKey::new("lisbon-cloud"),
                ENDPOINT,
                self.db.queue(),
                reconciler,
                self.central.clone(),
                &self.settings,
            )
        }

        async fn queue_partner(&self, record: &PartnerRecord) -> i64 {
            match self
                .gateway
                .notify_mutated(SyncContext::normal(), Operation::Update, record)
                .await
                .unwrap()
            {
                EnqueueOutcome::Queued(e) => e.id,
                other => panic!("expected Queued, got {other:?}"),
            }
        }
    }

    async fn setup(max_attempts: u32) -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let resolver = Arc::new(BindingResolver::new(db.bindings(), Duration::from_secs(60)));
        resolver
            .seed(&[PartitionSettings {
                key: "lisbon-cloud".into(),
                branch_id: "lisbon".into(),
                endpoint: ENDPOINT.into(),
            }])
            .await
            .unwrap();
        let gateway = SyncGateway::new(db.queue(), resolver, max_attempts);
        let settings = DispatchSettings {
            max_attempts,
            transport_timeout_secs: 1,
            ..DispatchSettings::default()
        };
        Fixture {
            db,
            central: Arc::new(FakeCentral::default()),
            gateway,
            settings,
        }
    }

    fn partner(id: &str, tax_id: Option<&str>) -> PartnerRecord {
        PartnerRecord {
            id: id.into(),
            name: "Ana Silva".into(),
            tax_id: tax_id.map(Into::into),
            email: None,
            phone: None,
            legacy_id: None,
            branch_id: Some("lisbon".into()),
            updated_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(EntityType, String, Option<String>)>>,
    }

    #[async_trait]
    impl SyncBookkeeping for Recorder {
        async fn record_synced(
            &self,
            entity_type: EntityType,
            local_record_id: &str,
            remote_record_id: Option<&str>,
            _synced_at: DateTime<Utc>,
        ) -> SyncResult<()> {
            self.calls.lock().unwrap().push((
                entity_type,
                local_record_id.to_string(),
                remote_record_id.map(str::to_string),
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ack_records_mapping_and_marks_synced() {
        let f = setup(5).await;
        let id = f.queue_partner(&partner("p-1", Some("PT1"))).await;
        let recorder = Arc::new(Recorder::default());
        let worker = f.worker().with_bookkeeping(recorder.clone());

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.synced, 1);

        let entry = f.db.queue().get_required(id).await.unwrap();
        assert_eq!(entry.state, EntryState::Synced);
        assert_eq!(entry.remote_record_id.as_deref(), Some("R-1"));

        let mapping = f.db.identities().get(EntityType::Partner, "p-1").await.unwrap().unwrap();
        assert_eq!(mapping.remote_record_id.as_deref(), Some("R-1"));

        // Queued as Update, but nothing existed remotely.
        assert_eq!(f.central.submitted()[0].operation, Operation::Create);
        assert_eq!(
            recorder.calls.lock().unwrap().clone(),
            vec![(EntityType::Partner, "p-1".to_string(), Some("R-1".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_replay_updates_existing_remote_record() {
        let f = setup(5).await;
        let worker = f.worker();

        f.queue_partner(&partner("p-1", Some("PT1"))).await;
        worker.run_cycle().await.unwrap();

        // Same record synced again, as after a crash-recovered re-attempt.
        let again = f.queue_partner(&partner("p-1", Some("PT1"))).await;
        worker.run_cycle().await.unwrap();

        let submitted = f.central.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].operation, Operation::Update);
        assert_eq!(submitted[1].remote_record_id.as_deref(), Some("R-1"));
        assert_eq!(f.central.remote_count(EntityType::Partner), 1);

        let entry = f.db.queue().get_required(again).await.unwrap();
        assert_eq!(entry.state, EntryState::Synced);
    }

    #[tokio::test]
    async fn test_record_created_remotely_is_matched_not_duplicated() {
        let f = setup(5).await;
        let remote = f.central.seed(
            EntityType::Partner,
            IdentityProbe {
                business_key: Some("PT1".into()),
                ..Default::default()
            },
        );
        f.queue_partner(&partner("p-1", Some("PT1"))).await;

        f.worker().run_cycle().await.unwrap();

        assert_eq!(f.central.remote_count(EntityType::Partner), 1);
        let submitted = f.central.submitted();
        assert_eq!(submitted[0].remote_record_id.as_deref(), Some(remote.as_str()));
        let mapping = f.db.identities().get(EntityType::Partner, "p-1").await.unwrap().unwrap();
        assert_eq!(mapping.remote_record_id, Some(remote));
    }

    #[tokio::test]
    async fn test_rejection_consumes_attempts_until_frozen() {
        let f = setup(1).await;
        let id = f.queue_partner(&partner("p-1", Some("PT1"))).await;
        f.central.reject("p-1");
        let worker = f.worker();

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.frozen, 1);

        let entry = f.db.queue().get_required(id).await.unwrap();
        assert_eq!(entry.state, EntryState::Error);
        assert_eq!(entry.error_kind, Some(ErrorKind::Rejected));
        assert_eq!(entry.error_message.as_deref(), Some("validation failed"));
        assert!(entry.is_frozen());

        // Frozen entries are never claimed again.
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn test_unreachable_central_schedules_retry() {
        let f = setup(5).await;
        let id = f.queue_partner(&partner("p-1", None)).await;
        f.central.set_down(true);

        let report = f.worker().run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.frozen, 0);

        let entry = f.db.queue().get_required(id).await.unwrap();
        assert_eq!(entry.state, EntryState::Error);
        assert_eq!(entry.error_kind, Some(ErrorKind::Transport));
        assert_eq!(entry.attempt_count, 1);
        assert!(entry.next_retry_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_hung_transport_times_out() {
        let f = setup(5).await;
        let id = f.queue_partner(&partner("p-1", None)).await;
        f.central.set_delay(Some(Duration::from_secs(3)));

        f.worker().run_cycle().await.unwrap();

        let entry = f.db.queue().get_required(id).await.unwrap();
        assert_eq!(entry.state, EntryState::Error);
        assert!(entry.error_message.unwrap().contains("no response within 1s"));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_reconcile_error_and_nothing_is_sent() {
        let f = setup(5).await;
        let id = f.queue_partner(&partner("p-1", Some("PT1"))).await;
        f.central.fail_lookups(true);

        f.worker().run_cycle().await.unwrap();

        let entry = f.db.queue().get_required(id).await.unwrap();
        assert_eq!(entry.error_kind, Some(ErrorKind::Reconcile));
        assert!(f.central.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_remote_counterpart_completes_locally() {
        let f = setup(5).await;
        let id = match f
            .gateway
            .notify_mutated(SyncContext::normal(), Operation::Delete, &partner("p-1", None))
            .await
            .unwrap()
        {
            EnqueueOutcome::Queued(e) => e.id,
            other => panic!("expected Queued, got {other:?}"),
        };

        let report = f.worker().run_cycle().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(f.central.submitted().is_empty());
        let entry = f.db.queue().get_required(id).await.unwrap();
        assert_eq!(entry.state, EntryState::Synced);
        assert_eq!(entry.remote_record_id, None);
    }

    #[tokio::test]
    async fn test_unreadable_payload_version_is_skipped() {
        let f = setup(5).await;
        let queued = f
            .db
            .queue()
            .enqueue(NewEntry {
                entity_type: EntityType::Partner,
                local_record_id: "p-9".into(),
                human_reference: "p-9".into(),
                operation: Operation::Create,
                payload: Payload {
                    version: 99,
                    body: serde_json::json!({}),
                },
                target_partition: PartitionKey::new("lisbon-cloud"),
                priority: Priority::Normal,
                depends_on: Vec::new(),
                identity: Default::default(),
                parent_record_id: None,
                max_attempts: 5,
            })
            .await
            .unwrap();

        let report = f.worker().run_cycle().await.unwrap();
        assert_eq!(report.skipped, 1);
        let entry = f.db.queue().get_required(queued.id).await.unwrap();
        assert_eq!(entry.state, EntryState::Skipped);
        assert_eq!(entry.error_kind, Some(ErrorKind::Integrity));
    }

    #[tokio::test]
    async fn test_dependent_order_waits_for_partner() {
        let f = setup(5).await;
        let partner_id = f.queue_partner(&partner("p-1", Some("PT1"))).await;
        let order = OrderRecord {
            id: "o-1".into(),
            reference: "0001-000042".into(),
            branch_id: Some("lisbon".into()),
            status: OrderStatus::Paid,
            partner_id: Some("p-1".into()),
            lines: Vec::new(),
            auxiliary_documents: Vec::new(),
            total_cents: 899,
            updated_at: Utc::now(),
        };
        f.gateway
            .notify_mutated(SyncContext::normal(), Operation::Create, &order)
            .await
            .unwrap();
        let worker = f.worker();

        // Higher priority, but not eligible until the partner is synced.
        let first = worker.run_cycle().await.unwrap();
        assert_eq!(first.claimed, 1);
        let second = worker.run_cycle().await.unwrap();
        assert_eq!(second.claimed, 1);

        let submitted = f.central.submitted();
        assert_eq!(submitted[0].entry_id, partner_id);
        assert_eq!(submitted[1].entity_type, EntityType::Order);
    }

    #[tokio::test]
    async fn test_late_ack_after_reap_does_not_touch_the_new_claim() {
        let f = setup(5).await;
        let id = f.queue_partner(&partner("p-1", None)).await;
        f.central.set_delay(Some(Duration::from_millis(300)));

        let worker = f.worker();
        let cycle = tokio::spawn(async move { worker.run_cycle().await.unwrap() });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // An operator reaps aggressively and another worker picks it up.
        let queue = f.db.queue();
        assert_eq!(queue.reap_stuck_processing(chrono::Duration::zero()).await.unwrap(), vec![id]);
        let reclaimed = queue.claim_batch(&PartitionKey::new("lisbon-cloud"), 1).await.unwrap();
        let current = reclaimed[0].claim_token.clone().unwrap();

        let report = cycle.await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.synced, 0);
        assert_eq!(report.failed, 0);

        let entry = queue.get_required(id).await.unwrap();
        assert_eq!(entry.state, EntryState::Processing);
        assert_eq!(entry.claim_token, Some(current));
        assert_eq!(entry.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_stopping_worker_releases_rest_of_batch() {
        let f = setup(5).await;
        let first = f.queue_partner(&partner("p-1", None)).await;
        let second = f.queue_partner(&partner("p-2", None)).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);

        let report = f.worker().cycle(Some(&shutdown_rx)).await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.released, 2);
        assert!(f.central.submitted().is_empty());

        for id in [first, second] {
            let entry = f.db.queue().get_required(id).await.unwrap();
            assert_eq!(entry.state, EntryState::Pending);
            assert_eq!(entry.attempt_count, 0);
        }
    }

    #[tokio::test]
    async fn test_run_loop_drains_and_stops_on_shutdown() {
        let f = setup(5).await;
        let id = f.queue_partner(&partner("p-1", None)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let trigger = Arc::new(Notify::new());

        let handle = tokio::spawn(f.worker().run(shutdown_rx, trigger));

        let mut synced = false;
        for _ in 0..50 {
            let entry = f.db.queue().get_required(id).await.unwrap();
            if entry.state == EntryState::Synced {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
