//! # Queue Repository
//!
//! The durable backlog of replication work.
//!
//! ## Claim Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Atomic Claim (one statement)                         │
//! │                                                                         │
//! │  UPDATE queue_entries                                                  │
//! │     SET state = 'processing', claim_token = <uuid>, claimed_at = now,  │
//! │         claimed_revision = payload_revision                            │
//! │   WHERE id IN (                                                        │
//! │       SELECT id FROM queue_entries                                     │
//! │        WHERE partition matches                                         │
//! │          AND state IN (pending, error)                                 │
//! │          AND next_retry_at passed, attempts left                       │
//! │          AND type is dispatched on its own                             │
//! │          AND every dependency is synced                                │
//! │        ORDER BY priority DESC, created_at, id                          │
//! │        LIMIT n)                                                        │
//! │  RETURNING id                                                          │
//! │                                                                         │
//! │  SQLite runs one writer at a time, so two claimers can never see the   │
//! │  same candidate: the second one re-evaluates the subquery after the    │
//! │  first commits and finds those rows already 'processing'.              │
//! │                                                                         │
//! │  The claim_token is the lease. Every outcome (mark_synced, mark_error, │
//! │  abandon, release) must present it; once reap_stuck_processing hands   │
//! │  a row back, a late outcome from the old holder gets ClaimLost.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Coalescing
//! `enqueue` is an `INSERT .. ON CONFLICT DO UPDATE` against the partial
//! unique index over non-terminal states, so concurrent mutations of the same
//! record can never produce two active entries.
//!
//! ## Dependencies
//! Any existing entry may be a dependency, older or newer. An edge is refused
//! only when the target already depends on this entry, directly or through
//! other entries. Embedded entries with no active parent entry wait; the
//! parent's next `enqueue` links them to itself.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use harbor_core::backoff;
use harbor_core::{
    AttemptOutcome, AttemptRecord, EntityType, EntryState, ErrorKind, IdentityProbe, Operation,
    PartitionKey, Payload, Priority, QueueEntry,
};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};

// =============================================================================
// Inputs & Outputs
// =============================================================================

/// A mutation to be queued.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub entity_type: EntityType,
    pub local_record_id: String,
    pub human_reference: String,
    pub operation: Operation,
    pub payload: Payload,
    pub target_partition: PartitionKey,
    pub priority: Priority,
    /// Ids of entries that must be `Synced` first. Unknown ids and edges
    /// that would close a cycle are dropped.
    pub depends_on: Vec<i64>,
    pub identity: IdentityProbe,
    /// Embedded types: the parent record whose entry carries this one.
    pub parent_record_id: Option<String>,
    pub max_attempts: u32,
}

/// Result of [`QueueRepository::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub id: i64,
    pub payload_revision: i64,
    pub operation: Operation,
    /// True when the mutation was merged into an existing active entry.
    pub coalesced: bool,
}

/// Result of [`QueueRepository::mark_synced`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncedOutcome {
    /// The acknowledged payload is the latest one.
    Synced,
    /// A newer payload arrived while in flight; the entry is `Pending` again.
    Requeued,
}

/// A failed dispatch, as recorded by [`QueueRepository::mark_error`].
#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    pub response: Option<String>,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Failure {
            kind,
            message: message.into(),
            response: None,
        }
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }
}

/// Retry schedule after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
}

impl RetrySchedule {
    /// No automatic retry remains; an operator must reset the entry.
    pub fn is_frozen(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Operator listing filter.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    pub partition: Option<PartitionKey>,
    pub entity_type: Option<EntityType>,
    /// Empty means every state.
    pub states: Vec<EntryState>,
    pub limit: u32,
}

impl Default for EntryFilter {
    fn default() -> Self {
        EntryFilter {
            partition: None,
            entity_type: None,
            states: vec![EntryState::Pending, EntryState::Error],
            limit: 100,
        }
    }
}

/// Number of entries in one state for one partition.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StateCount {
    #[sqlx(try_from = "String")]
    pub partition: PartitionKey,
    pub state: EntryState,
    pub count: i64,
}

// =============================================================================
// Row Mapping
// =============================================================================

const ENTRY_COLUMNS: &str = "id, entity_type, local_record_id, human_reference, operation, \
     payload, payload_version, payload_revision, target_partition, priority, state, \
     attempt_count, max_attempts, last_attempt_at, next_retry_at, remote_record_id, identity, \
     parent_record_id, error_message, error_kind, last_response_snapshot, claim_token, \
     claimed_at, created_at, updated_at, synced_at";

#[derive(Debug, sqlx::FromRow)]
struct QueueEntryRow {
    id: i64,
    entity_type: EntityType,
    local_record_id: String,
    human_reference: String,
    operation: Operation,
    payload: String,
    payload_version: i64,
    payload_revision: i64,
    target_partition: String,
    priority: i64,
    state: EntryState,
    attempt_count: i64,
    max_attempts: i64,
    last_attempt_at: Option<i64>,
    next_retry_at: Option<i64>,
    remote_record_id: Option<String>,
    identity: String,
    parent_record_id: Option<String>,
    error_message: Option<String>,
    error_kind: Option<ErrorKind>,
    last_response_snapshot: Option<String>,
    claim_token: Option<String>,
    claimed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    synced_at: Option<i64>,
}

impl QueueEntryRow {
    fn into_entry(self, depends_on: Vec<i64>) -> DbResult<QueueEntry> {
        let body = serde_json::from_str(&self.payload)
            .map_err(|e| DbError::corrupt("queue_entries", format!("payload of {}: {e}", self.id)))?;
        let identity = serde_json::from_str(&self.identity)
            .map_err(|e| DbError::corrupt("queue_entries", format!("identity of {}: {e}", self.id)))?;

        Ok(QueueEntry {
            id: self.id,
            entity_type: self.entity_type,
            local_record_id: self.local_record_id,
            human_reference: self.human_reference,
            operation: self.operation,
            payload: Payload {
                version: self.payload_version as u32,
                body,
            },
            payload_revision: self.payload_revision,
            target_partition: PartitionKey::new(self.target_partition),
            priority: Priority::from_rank(self.priority),
            state: self.state,
            attempt_count: self.attempt_count as u32,
            max_attempts: self.max_attempts as u32,
            last_attempt_at: opt_from_millis(self.last_attempt_at)?,
            next_retry_at: opt_from_millis(self.next_retry_at)?,
            depends_on,
            remote_record_id: self.remote_record_id,
            identity,
            parent_record_id: self.parent_record_id,
            error_message: self.error_message,
            error_kind: self.error_kind,
            last_response_snapshot: self.last_response_snapshot,
            claim_token: self.claim_token,
            claimed_at: opt_from_millis(self.claimed_at)?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            synced_at: opt_from_millis(self.synced_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    entry_id: i64,
    attempt_number: i64,
    outcome: AttemptOutcome,
    detail: Option<String>,
    recorded_at: i64,
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::corrupt("queue_entries", format!("timestamp out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> DbResult<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

/// SQL list of entity types that never dispatch on their own.
fn embedded_type_list() -> String {
    let tags: Vec<String> = EntityType::embedded()
        .map(|t| format!("'{}'", t.as_str()))
        .collect();
    if tags.is_empty() {
        // `NOT IN (NULL)` would exclude everything
        "''".to_string()
    } else {
        tags.join(", ")
    }
}

/// `CASE` expression applying [`Operation::coalesce`] inside the upsert.
fn coalesce_operation_sql(incoming: Operation) -> String {
    let arms: String = [Operation::Create, Operation::Update, Operation::Delete]
        .into_iter()
        .map(|existing| {
            format!(
                " WHEN '{}' THEN '{}'",
                existing.as_str(),
                Operation::coalesce(existing, incoming).as_str()
            )
        })
        .collect();
    format!("CASE queue_entries.operation{arms} ELSE excluded.operation END")
}

/// Dependency condition shared by claim and retention queries: the row
/// aliased `e` has a dependency that is missing or not yet `Synced`.
const HAS_UNSYNCED_DEPENDENCY: &str = "EXISTS (
        SELECT 1 FROM queue_dependencies d
        LEFT JOIN queue_entries p ON p.id = d.depends_on_id
        WHERE d.entry_id = e.id AND (p.id IS NULL OR p.state <> 'synced'))";

// =============================================================================
// Repository
// =============================================================================

/// Repository for queue entries, their dependencies and attempt history.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    /// Creates a new QueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        QueueRepository { pool }
    }

    // -------------------------------------------------------------------------
    // Enqueue
    // -------------------------------------------------------------------------

    /// Queues a mutation, coalescing into the active entry for the same
    /// (type, record, partition) if one exists.
    ///
    /// On coalesce the payload, priority, identity and display reference are
    /// replaced wholesale, the operation is merged, `payload_revision` is
    /// bumped and the dependency set is replaced. State and attempt counters
    /// are left alone, so a frozen entry stays frozen until an operator resets it.
    pub async fn enqueue(&self, entry: NewEntry) -> DbResult<Enqueued> {
        self.enqueue_at(entry, Utc::now()).await
    }

    pub async fn enqueue_at(&self, entry: NewEntry, now: DateTime<Utc>) -> DbResult<Enqueued> {
        let payload = serde_json::to_string(&entry.payload.body)
            .map_err(|e| DbError::Internal(format!("payload encode: {e}")))?;
        let identity = serde_json::to_string(&entry.identity)
            .map_err(|e| DbError::Internal(format!("identity encode: {e}")))?;
        let now_ms = to_millis(now);

        let sql = format!(
            r#"
            INSERT INTO queue_entries (
                entity_type, local_record_id, human_reference, operation,
                payload, payload_version, target_partition, priority,
                state, max_attempts, identity, parent_record_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?10, ?12, ?11, ?11)
            ON CONFLICT (entity_type, local_record_id, target_partition)
                WHERE state IN ('pending', 'processing', 'error')
            DO UPDATE SET
                human_reference = excluded.human_reference,
                operation = {operation},
                payload = excluded.payload,
                payload_version = excluded.payload_version,
                payload_revision = queue_entries.payload_revision + 1,
                priority = excluded.priority,
                identity = excluded.identity,
                parent_record_id = excluded.parent_record_id,
                updated_at = excluded.updated_at
            RETURNING id, payload_revision, operation
            "#,
            operation = coalesce_operation_sql(entry.operation)
        );

        let mut tx = self.pool.begin().await?;

        let (id, payload_revision, operation): (i64, i64, Operation) = sqlx::query_as(&sql)
            .bind(entry.entity_type)
            .bind(&entry.local_record_id)
            .bind(&entry.human_reference)
            .bind(entry.operation)
            .bind(&payload)
            .bind(entry.payload.version as i64)
            .bind(entry.target_partition.as_str())
            .bind(entry.priority.rank())
            .bind(entry.max_attempts as i64)
            .bind(&identity)
            .bind(now_ms)
            .bind(entry.parent_record_id.as_deref())
            .fetch_one(&mut *tx)
            .await?;

        let coalesced = payload_revision > 1;
        if coalesced {
            sqlx::query("DELETE FROM queue_dependencies WHERE entry_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        for dep in &entry.depends_on {
            let (known, cyclic): (bool, bool) = sqlx::query_as(
                r#"
                WITH RECURSIVE upstream(id) AS (
                    SELECT ?2
                    UNION
                    SELECT d.depends_on_id
                    FROM queue_dependencies d JOIN upstream u ON d.entry_id = u.id
                )
                SELECT EXISTS (SELECT 1 FROM queue_entries WHERE id = ?2),
                       EXISTS (SELECT 1 FROM upstream WHERE id = ?1)
                "#,
            )
            .bind(id)
            .bind(dep)
            .fetch_one(&mut *tx)
            .await?;

            if !known {
                warn!(entry_id = id, depends_on = dep, "Ignoring dependency on unknown entry");
                continue;
            }
            if cyclic {
                warn!(entry_id = id, depends_on = dep, "Ignoring dependency that would close a cycle");
                continue;
            }
            sqlx::query(
                "INSERT OR IGNORE INTO queue_dependencies (entry_id, depends_on_id) VALUES (?1, ?2)",
            )
            .bind(id)
            .bind(dep)
            .execute(&mut *tx)
            .await?;
        }

        let linked = link_waiting_children(&mut tx, id, &entry).await?;

        tx.commit().await?;

        debug!(
            entry_id = id,
            entity_type = %entry.entity_type,
            local_record_id = %entry.local_record_id,
            partition = %entry.target_partition,
            revision = payload_revision,
            coalesced,
            linked,
            "Enqueued"
        );

        Ok(Enqueued {
            id,
            payload_revision,
            operation,
            coalesced,
        })
    }

    // -------------------------------------------------------------------------
    // Claim
    // -------------------------------------------------------------------------

    /// Atomically claims up to `limit` ready entries of one partition.
    ///
    /// Returned entries are `Processing` and ordered by priority (highest
    /// first), then age, then id. Concurrent callers get disjoint sets.
    pub async fn claim_batch(&self, partition: &PartitionKey, limit: u32) -> DbResult<Vec<QueueEntry>> {
        self.claim_batch_at(partition, limit, Utc::now()).await
    }

    pub async fn claim_batch_at(
        &self,
        partition: &PartitionKey,
        limit: u32,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let token = Uuid::new_v4().to_string();
        let now_ms = to_millis(now);

        let sql = format!(
            r#"
            UPDATE queue_entries SET
                state = 'processing',
                claim_token = ?1,
                claimed_at = ?2,
                claimed_revision = payload_revision,
                updated_at = ?2
            WHERE state IN ('pending', 'error')
              AND id IN (
                SELECT e.id FROM queue_entries e
                WHERE e.target_partition = ?3
                  AND e.state IN ('pending', 'error')
                  AND (e.next_retry_at IS NULL OR e.next_retry_at <= ?2)
                  AND e.attempt_count < e.max_attempts
                  AND e.entity_type NOT IN ({embedded})
                  AND NOT {HAS_UNSYNCED_DEPENDENCY}
                ORDER BY e.priority DESC, e.created_at ASC, e.id ASC
                LIMIT ?4
              )
            RETURNING id
            "#,
            embedded = embedded_type_list(),
        );

        // The claim and the read-back share a transaction so the rows come
        // back exactly as this claim left them.
        let mut tx = self.pool.begin().await?;
        let claimed: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(&token)
            .bind(now_ms)
            .bind(partition.as_str())
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;

        if claimed.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let select = format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries \
             WHERE claim_token = ?1 \
             ORDER BY priority DESC, created_at ASC, id ASC"
        );
        let rows: Vec<QueueEntryRow> = sqlx::query_as(&select)
            .bind(&token)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(partition = %partition, count = rows.len(), "Claimed batch");
        self.hydrate(rows).await
    }

    // -------------------------------------------------------------------------
    // Outcomes
    // -------------------------------------------------------------------------

    /// Records a successful dispatch.
    ///
    /// If the payload was replaced while the entry was in flight, the remote
    /// id is kept but the entry goes back to `Pending` so the newer snapshot
    /// replicates too (a pending `Create` becomes an `Update` once the remote
    /// knows the record).
    pub async fn mark_synced(
        &self,
        id: i64,
        claim_token: &str,
        remote_record_id: Option<&str>,
        response: Option<&str>,
    ) -> DbResult<SyncedOutcome> {
        let now_ms = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        let updated: Option<(EntryState, i64)> = sqlx::query_as(
            r#"
            UPDATE queue_entries SET
                state = CASE WHEN payload_revision = claimed_revision
                             THEN 'synced' ELSE 'pending' END,
                operation = CASE WHEN payload_revision <> claimed_revision
                                  AND operation = 'create'
                                  AND COALESCE(?2, remote_record_id) IS NOT NULL
                                 THEN 'update' ELSE operation END,
                remote_record_id = COALESCE(?2, remote_record_id),
                error_message = NULL,
                error_kind = NULL,
                last_response_snapshot = COALESCE(?3, last_response_snapshot),
                last_attempt_at = ?4,
                next_retry_at = NULL,
                synced_at = CASE WHEN payload_revision = claimed_revision THEN ?4 ELSE NULL END,
                claim_token = NULL,
                claimed_at = NULL,
                updated_at = ?4
            WHERE id = ?1 AND state = 'processing' AND claim_token = ?5
            RETURNING state, attempt_count
            "#,
        )
        .bind(id)
        .bind(remote_record_id)
        .bind(response)
        .bind(now_ms)
        .bind(claim_token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((state, attempt_count)) = updated else {
            drop(tx);
            return Err(self.outcome_error(id, claim_token, EntryState::Synced).await);
        };

        let outcome = if state == EntryState::Synced {
            SyncedOutcome::Synced
        } else {
            SyncedOutcome::Requeued
        };
        let detail = match (outcome, remote_record_id) {
            (SyncedOutcome::Synced, Some(remote)) => format!("remote id {remote}"),
            (SyncedOutcome::Synced, None) => "acknowledged".to_string(),
            (SyncedOutcome::Requeued, _) => "acknowledged; newer payload pending".to_string(),
        };
        insert_attempt(&mut tx, id, attempt_count + 1, AttemptOutcome::Acked, Some(&detail), now_ms).await?;
        tx.commit().await?;

        debug!(entry_id = id, ?outcome, "Marked synced");
        Ok(outcome)
    }

    /// Records a failed dispatch and schedules the next retry.
    pub async fn mark_error(
        &self,
        id: i64,
        claim_token: &str,
        failure: &Failure,
        backoff_cap: Duration,
    ) -> DbResult<RetrySchedule> {
        self.mark_error_at(id, claim_token, failure, backoff_cap, Utc::now())
            .await
    }

    pub async fn mark_error_at(
        &self,
        id: i64,
        claim_token: &str,
        failure: &Failure,
        backoff_cap: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<RetrySchedule> {
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT attempt_count FROM queue_entries \
             WHERE id = ?1 AND state = 'processing' AND claim_token = ?2",
        )
        .bind(id)
        .bind(claim_token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(attempt_count) = current else {
            return Err(self.outcome_error(id, claim_token, EntryState::Error).await);
        };

        let new_count = (attempt_count + 1) as u32;
        let next_retry_at = backoff::next_retry_at(now, new_count, backoff_cap);
        let now_ms = to_millis(now);

        let mut tx = self.pool.begin().await?;
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE queue_entries SET
                state = 'error',
                attempt_count = attempt_count + 1,
                last_attempt_at = ?3,
                next_retry_at = ?4,
                error_message = ?5,
                error_kind = ?6,
                last_response_snapshot = COALESCE(?7, last_response_snapshot),
                claim_token = NULL,
                claimed_at = NULL,
                updated_at = ?3
            WHERE id = ?1 AND state = 'processing' AND attempt_count = ?2
              AND claim_token = ?8
            RETURNING max_attempts
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(now_ms)
        .bind(to_millis(next_retry_at))
        .bind(&failure.message)
        .bind(failure.kind)
        .bind(failure.response.as_deref())
        .bind(claim_token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(max_attempts) = updated else {
            // Reaped between the read and the write
            drop(tx);
            return Err(self.outcome_error(id, claim_token, EntryState::Error).await);
        };

        let outcome = match failure.kind {
            ErrorKind::Rejected => AttemptOutcome::Rejected,
            _ => AttemptOutcome::TransportError,
        };
        let detail = format!("{}: {}", failure.kind, failure.message);
        insert_attempt(&mut tx, id, new_count as i64, outcome, Some(&detail), now_ms).await?;
        tx.commit().await?;

        let schedule = RetrySchedule {
            attempt_count: new_count,
            max_attempts: max_attempts as u32,
            next_retry_at,
        };
        if schedule.is_frozen() {
            warn!(
                entry_id = id,
                attempt = new_count,
                kind = %failure.kind,
                "Entry exhausted its attempts; waiting for operator reset"
            );
        } else {
            debug!(entry_id = id, attempt = new_count, next_retry_at = %next_retry_at, "Marked error");
        }
        Ok(schedule)
    }

    /// Returns an entry to `Pending` with cleared counters (operator retry).
    pub async fn reset_to_pending(&self, id: i64) -> DbResult<()> {
        let now_ms = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE queue_entries SET
                state = 'pending',
                attempt_count = 0,
                next_retry_at = NULL,
                error_message = NULL,
                error_kind = NULL,
                updated_at = ?2
            WHERE id = ?1 AND state IN ('pending', 'error')
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            drop(tx);
            return Err(self.transition_error(id, EntryState::Pending).await);
        }
        insert_attempt(&mut tx, id, 0, AttemptOutcome::Reset, None, now_ms).await?;
        tx.commit().await?;

        info!(entry_id = id, "Entry reset to pending");
        Ok(())
    }

    /// Operator skip of a `Pending` or `Error` entry.
    pub async fn skip(&self, id: i64, kind: ErrorKind, reason: &str) -> DbResult<()> {
        self.skip_from(id, &["pending", "error"], None, kind, reason).await
    }

    /// Skips an entry the worker holds but cannot process (unreadable payload).
    pub async fn abandon(
        &self,
        id: i64,
        claim_token: &str,
        kind: ErrorKind,
        reason: &str,
    ) -> DbResult<()> {
        self.skip_from(id, &["processing"], Some(claim_token), kind, reason)
            .await
    }

    async fn skip_from(
        &self,
        id: i64,
        from_states: &[&str],
        claim_token: Option<&str>,
        kind: ErrorKind,
        reason: &str,
    ) -> DbResult<()> {
        let now_ms = to_millis(Utc::now());
        let states = from_states
            .iter()
            .map(|s| format!("'{s}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            UPDATE queue_entries SET
                state = 'skipped',
                error_message = ?2,
                error_kind = ?3,
                claim_token = NULL,
                claimed_at = NULL,
                updated_at = ?4
            WHERE id = ?1 AND state IN ({states})
              AND (?5 IS NULL OR claim_token = ?5)
            RETURNING attempt_count
            "#
        );

        let mut tx = self.pool.begin().await?;
        let updated: Option<i64> = sqlx::query_scalar(&sql)
            .bind(id)
            .bind(reason)
            .bind(kind)
            .bind(now_ms)
            .bind(claim_token)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(attempt_count) = updated else {
            drop(tx);
            return Err(match claim_token {
                Some(token) => self.outcome_error(id, token, EntryState::Skipped).await,
                None => self.transition_error(id, EntryState::Skipped).await,
            });
        };
        let detail = format!("{kind}: {reason}");
        insert_attempt(&mut tx, id, attempt_count, AttemptOutcome::Skipped, Some(&detail), now_ms).await?;
        tx.commit().await?;

        warn!(entry_id = id, kind = %kind, reason, "Entry skipped");
        Ok(())
    }

    /// Hands a claimed entry back without consuming an attempt.
    pub async fn release(&self, id: i64, claim_token: &str, reason: &str) -> DbResult<()> {
        let now_ms = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE queue_entries SET
                state = 'pending', claim_token = NULL, claimed_at = NULL, updated_at = ?2
            WHERE id = ?1 AND state = 'processing' AND claim_token = ?3
            RETURNING attempt_count
            "#,
        )
        .bind(id)
        .bind(now_ms)
        .bind(claim_token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(attempt_count) = updated else {
            drop(tx);
            return Err(self.outcome_error(id, claim_token, EntryState::Pending).await);
        };
        insert_attempt(&mut tx, id, attempt_count, AttemptOutcome::Requeued, Some(reason), now_ms).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Completes a non-dispatched entry directly (`Pending/Error -> Synced`).
    pub async fn complete_without_dispatch(&self, id: i64, detail: &str) -> DbResult<()> {
        let now_ms = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE queue_entries SET
                state = 'synced',
                error_message = NULL,
                error_kind = NULL,
                next_retry_at = NULL,
                synced_at = ?2,
                updated_at = ?2
            WHERE id = ?1 AND state IN ('pending', 'error')
            RETURNING attempt_count
            "#,
        )
        .bind(id)
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(attempt_count) = updated else {
            drop(tx);
            return Err(self.transition_error(id, EntryState::Synced).await);
        };
        insert_attempt(
            &mut tx,
            id,
            attempt_count,
            AttemptOutcome::CompletedWithParent,
            Some(detail),
            now_ms,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------

    /// Returns entries stuck in `Processing` longer than `stale_after` to
    /// `Pending`. Returns the recovered ids.
    pub async fn reap_stuck_processing(&self, stale_after: Duration) -> DbResult<Vec<i64>> {
        self.reap_stuck_processing_at(stale_after, Utc::now()).await
    }

    pub async fn reap_stuck_processing_at(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<i64>> {
        let now_ms = to_millis(now);
        let cutoff = to_millis(now - stale_after);

        let mut tx = self.pool.begin().await?;
        let reaped: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE queue_entries SET
                state = 'pending', claim_token = NULL, claimed_at = NULL, updated_at = ?2
            WHERE state = 'processing' AND claimed_at <= ?1
            RETURNING id, attempt_count
            "#,
        )
        .bind(cutoff)
        .bind(now_ms)
        .fetch_all(&mut *tx)
        .await?;

        let detail = format!("processing for more than {}s", stale_after.num_seconds());
        for (id, attempt_count) in &reaped {
            insert_attempt(&mut tx, *id, *attempt_count, AttemptOutcome::Reaped, Some(&detail), now_ms)
                .await?;
        }
        tx.commit().await?;

        let ids: Vec<i64> = reaped.into_iter().map(|(id, _)| id).collect();
        if !ids.is_empty() {
            warn!(count = ids.len(), ?ids, "Reaped entries stuck in processing");
        }
        Ok(ids)
    }

    /// Deletes `Synced` entries older than `older_than`, and dependency rows
    /// pointing at them. Returns the number of entries deleted.
    pub async fn purge_synced(&self, older_than: Duration) -> DbResult<u64> {
        self.purge_synced_at(older_than, Utc::now()).await
    }

    pub async fn purge_synced_at(&self, older_than: Duration, now: DateTime<Utc>) -> DbResult<u64> {
        let cutoff = to_millis(now - older_than);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM queue_dependencies
            WHERE depends_on_id IN (
                SELECT id FROM queue_entries WHERE state = 'synced' AND synced_at < ?1
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM queue_entries WHERE state = 'synced' AND synced_at < ?1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!(purged, "Purged synced entries");
        }
        Ok(purged)
    }

    /// Skips active entries that can never become eligible: a dependency that
    /// vanished or was skipped, or an embedded entry that names no parent
    /// record. Repeats until the skip no longer cascades.
    pub async fn skip_unresolvable(&self) -> DbResult<Vec<i64>> {
        let sql = format!(
            r#"
            UPDATE queue_entries SET
                state = 'skipped',
                error_kind = 'dependency',
                error_message = COALESCE(
                    (SELECT 'dependency on entry ' || d.depends_on_id || ' can no longer sync'
                       FROM queue_dependencies d
                       LEFT JOIN queue_entries p ON p.id = d.depends_on_id
                      WHERE d.entry_id = queue_entries.id
                        AND (p.id IS NULL OR p.state = 'skipped')
                      LIMIT 1),
                    'no parent record to sync with'),
                updated_at = ?1
            WHERE id IN (
                SELECT e.id FROM queue_entries e
                WHERE e.state IN ('pending', 'error')
                  AND (
                    EXISTS (
                        SELECT 1 FROM queue_dependencies d
                        LEFT JOIN queue_entries p ON p.id = d.depends_on_id
                        WHERE d.entry_id = e.id AND (p.id IS NULL OR p.state = 'skipped'))
                    OR (e.entity_type IN ({embedded})
                        AND e.parent_record_id IS NULL
                        AND NOT EXISTS (SELECT 1 FROM queue_dependencies d WHERE d.entry_id = e.id))
                  )
            )
            RETURNING id, attempt_count, error_message
            "#,
            embedded = embedded_type_list(),
        );

        let mut all = Vec::new();
        loop {
            let now_ms = to_millis(Utc::now());
            let mut tx = self.pool.begin().await?;
            let skipped: Vec<(i64, i64, Option<String>)> = sqlx::query_as(&sql)
                .bind(now_ms)
                .fetch_all(&mut *tx)
                .await?;
            for (id, attempt_count, message) in &skipped {
                insert_attempt(
                    &mut tx,
                    *id,
                    *attempt_count,
                    AttemptOutcome::Skipped,
                    message.as_deref(),
                    now_ms,
                )
                .await?;
            }
            tx.commit().await?;

            if skipped.is_empty() {
                break;
            }
            for (id, _, message) in &skipped {
                warn!(entry_id = id, reason = message.as_deref().unwrap_or(""), "Unresolvable dependency; entry skipped");
            }
            all.extend(skipped.into_iter().map(|(id, _, _)| id));
        }
        Ok(all)
    }

    /// Marks embedded entries `Synced` once every parent they depend on is
    /// `Synced`. Returns the completed ids.
    pub async fn complete_embedded_with_parent(&self) -> DbResult<Vec<i64>> {
        let sql = format!(
            r#"
            UPDATE queue_entries SET
                state = 'synced',
                error_message = NULL,
                error_kind = NULL,
                next_retry_at = NULL,
                synced_at = ?1,
                updated_at = ?1
            WHERE id IN (
                SELECT e.id FROM queue_entries e
                WHERE e.state IN ('pending', 'error')
                  AND e.entity_type IN ({embedded})
                  AND EXISTS (SELECT 1 FROM queue_dependencies d WHERE d.entry_id = e.id)
                  AND NOT {HAS_UNSYNCED_DEPENDENCY}
            )
            RETURNING id, attempt_count
            "#,
            embedded = embedded_type_list(),
        );

        let now_ms = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        let done: Vec<(i64, i64)> = sqlx::query_as(&sql).bind(now_ms).fetch_all(&mut *tx).await?;
        for (id, attempt_count) in &done {
            insert_attempt(
                &mut tx,
                *id,
                *attempt_count,
                AttemptOutcome::CompletedWithParent,
                Some("parent synced"),
                now_ms,
            )
            .await?;
        }
        tx.commit().await?;

        Ok(done.into_iter().map(|(id, _)| id).collect())
    }

    /// Active entries of embedded types (for the local-record existence pass).
    pub async fn active_embedded(&self, limit: u32) -> DbResult<Vec<QueueEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries \
             WHERE state IN ('pending', 'error') AND entity_type IN ({}) \
             ORDER BY id LIMIT ?1",
            embedded_type_list()
        );
        let rows: Vec<QueueEntryRow> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate(rows).await
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn get(&self, id: i64) -> DbResult<Option<QueueEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1");
        let row: Option<QueueEntryRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(self.hydrate(row.into_iter().collect()).await?.pop())
    }

    /// Like [`get`](Self::get) but a missing entry is an error.
    pub async fn get_required(&self, id: i64) -> DbResult<QueueEntry> {
        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found("QueueEntry", id))
    }

    /// The non-terminal entry for a key, if any.
    pub async fn find_active(
        &self,
        entity_type: EntityType,
        local_record_id: &str,
        partition: &PartitionKey,
    ) -> DbResult<Option<QueueEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries \
             WHERE entity_type = ?1 AND local_record_id = ?2 AND target_partition = ?3 \
               AND state IN ('pending', 'processing', 'error')"
        );
        let row: Option<QueueEntryRow> = sqlx::query_as(&sql)
            .bind(entity_type)
            .bind(local_record_id)
            .bind(partition.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(self.hydrate(row.into_iter().collect()).await?.pop())
    }

    /// Every non-terminal entry for a record, across partitions.
    pub async fn find_active_for_record(
        &self,
        entity_type: EntityType,
        local_record_id: &str,
    ) -> DbResult<Vec<QueueEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries \
             WHERE entity_type = ?1 AND local_record_id = ?2 \
               AND state IN ('pending', 'processing', 'error') \
             ORDER BY id"
        );
        let rows: Vec<QueueEntryRow> = sqlx::query_as(&sql)
            .bind(entity_type)
            .bind(local_record_id)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate(rows).await
    }

    /// Operator listing, ordered the way the worker would drain.
    pub async fn list(&self, filter: &EntryFilter) -> DbResult<Vec<QueueEntry>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE 1 = 1"));

        if let Some(partition) = &filter.partition {
            qb.push(" AND target_partition = ")
                .push_bind(partition.as_str().to_string());
        }
        if let Some(entity_type) = filter.entity_type {
            qb.push(" AND entity_type = ").push_bind(entity_type);
        }
        if !filter.states.is_empty() {
            qb.push(" AND state IN (");
            let mut states = qb.separated(", ");
            for state in &filter.states {
                states.push_bind(*state);
            }
            states.push_unseparated(")");
        }
        qb.push(" ORDER BY target_partition, priority DESC, created_at ASC, id ASC LIMIT ")
            .push_bind(filter.limit as i64);

        let rows = qb
            .build_query_as::<QueueEntryRow>()
            .fetch_all(&self.pool)
            .await?;
        self.hydrate(rows).await
    }

    /// Attempt history of one entry, oldest first.
    pub async fn attempts(&self, id: i64) -> DbResult<Vec<AttemptRecord>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r#"
            SELECT entry_id, attempt_number, outcome, detail, recorded_at
            FROM queue_attempts
            WHERE entry_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(AttemptRecord {
                    entry_id: row.entry_id,
                    attempt_number: row.attempt_number as u32,
                    outcome: row.outcome,
                    detail: row.detail,
                    recorded_at: from_millis(row.recorded_at)?,
                })
            })
            .collect()
    }

    /// Entry counts grouped by partition and state.
    pub async fn count_by_state(&self) -> DbResult<Vec<StateCount>> {
        let counts = sqlx::query_as::<_, StateCount>(
            r#"
            SELECT target_partition AS partition, state, COUNT(*) AS count
            FROM queue_entries
            GROUP BY target_partition, state
            ORDER BY target_partition, state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }

    /// Entries frozen in `Error` with no automatic retry left.
    pub async fn count_frozen(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_entries WHERE state = 'error' AND attempt_count >= max_attempts",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn hydrate(&self, rows: Vec<QueueEntryRow>) -> DbResult<Vec<QueueEntry>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut deps = self.load_dependencies(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let depends_on = deps.remove(&row.id).unwrap_or_default();
                row.into_entry(depends_on)
            })
            .collect()
    }

    async fn load_dependencies(&self, ids: &[i64]) -> DbResult<HashMap<i64, Vec<i64>>> {
        let ids_json = serde_json::to_string(ids)
            .map_err(|e| DbError::Internal(format!("id list encode: {e}")))?;
        let pairs: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT entry_id, depends_on_id
            FROM queue_dependencies
            WHERE entry_id IN (SELECT value FROM json_each(?1))
            ORDER BY entry_id, depends_on_id
            "#,
        )
        .bind(ids_json)
        .fetch_all(&self.pool)
        .await?;

        let mut map: HashMap<i64, Vec<i64>> = HashMap::new();
        for (entry_id, depends_on_id) in pairs {
            map.entry(entry_id).or_default().push(depends_on_id);
        }
        Ok(map)
    }

    /// Why a claim-holder's outcome matched no row.
    async fn outcome_error(&self, id: i64, claim_token: &str, to: EntryState) -> DbError {
        let current: Result<Option<(EntryState, Option<String>)>, sqlx::Error> =
            sqlx::query_as("SELECT state, claim_token FROM queue_entries WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;
        match current {
            Ok(Some((EntryState::Processing, held))) if held.as_deref() != Some(claim_token) => {
                DbError::ClaimLost { id }
            }
            // Reaped and not claimed again yet
            Ok(Some((EntryState::Pending | EntryState::Error, _))) => DbError::ClaimLost { id },
            Ok(Some((from, _))) => DbError::InvalidTransition { id, from, to },
            Ok(None) => DbError::not_found("QueueEntry", id),
            Err(e) => e.into(),
        }
    }

    async fn transition_error(&self, id: i64, to: EntryState) -> DbError {
        let state: Result<Option<EntryState>, sqlx::Error> =
            sqlx::query_scalar("SELECT state FROM queue_entries WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;
        match state {
            Ok(Some(from)) => DbError::InvalidTransition { id, from, to },
            Ok(None) => DbError::not_found("QueueEntry", id),
            Err(e) => e.into(),
        }
    }
}

/// Points active embedded entries waiting on `entry`'s record at the entry
/// that will carry them. Returns how many were linked.
async fn link_waiting_children(
    conn: &mut SqliteConnection,
    id: i64,
    entry: &NewEntry,
) -> DbResult<u64> {
    let children: Vec<String> = EntityType::embedded()
        .filter(|t| t.embedded_in() == Some(entry.entity_type))
        .map(|t| format!("'{}'", t.as_str()))
        .collect();
    if children.is_empty() {
        return Ok(0);
    }

    let sql = format!(
        r#"
        INSERT OR IGNORE INTO queue_dependencies (entry_id, depends_on_id)
        SELECT e.id, ?1 FROM queue_entries e
        WHERE e.parent_record_id = ?2
          AND e.target_partition = ?3
          AND e.state IN ('pending', 'error')
          AND e.entity_type IN ({})
        "#,
        children.join(", ")
    );
    let result = sqlx::query(&sql)
        .bind(id)
        .bind(&entry.local_record_id)
        .bind(entry.target_partition.as_str())
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

async fn insert_attempt(
    conn: &mut SqliteConnection,
    entry_id: i64,
    attempt_number: i64,
    outcome: AttemptOutcome,
    detail: Option<&str>,
    recorded_at: i64,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO queue_attempts (entry_id, attempt_number, outcome, detail, recorded_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(entry_id)
    .bind(attempt_number)
    .bind(outcome)
    .bind(detail)
    .bind(recorded_at)
    .execute(conn)
    .await?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use serde_json::json;
    use std::collections::HashSet;

    fn partition() -> PartitionKey {
        PartitionKey::new("lisbon-cloud")
    }

    fn new_entry(entity_type: EntityType, local_id: &str, body: serde_json::Value) -> NewEntry {
        NewEntry {
            entity_type,
            local_record_id: local_id.to_string(),
            human_reference: format!("{entity_type} {local_id}"),
            operation: Operation::Create,
            payload: Payload::new(body),
            target_partition: partition(),
            priority: Priority::Normal,
            depends_on: Vec::new(),
            identity: IdentityProbe::default(),
            parent_record_id: None,
            max_attempts: 5,
        }
    }

    fn order(local_id: &str) -> NewEntry {
        new_entry(EntityType::Order, local_id, json!({ "id": local_id }))
    }

    async fn setup() -> QueueRepository {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.queue()
    }

    async fn claim_ids(repo: &QueueRepository, limit: u32) -> Vec<i64> {
        repo.claim_batch(&partition(), limit)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect()
    }

    /// Claims the next single entry, returning its id and claim token.
    async fn claim_one(repo: &QueueRepository) -> (i64, String) {
        let mut batch = repo.claim_batch(&partition(), 1).await.unwrap();
        let entry = batch.pop().expect("nothing claimable");
        (entry.id, entry.claim_token.expect("claimed entry carries a token"))
    }

    #[tokio::test]
    async fn test_enqueue_creates_pending_entry() {
        let repo = setup().await;
        let queued = repo.enqueue(order("o-1")).await.unwrap();

        assert!(!queued.coalesced);
        let entry = repo.get_required(queued.id).await.unwrap();
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.payload_revision, 1);
        assert_eq!(entry.payload.body, json!({ "id": "o-1" }));
        assert_eq!(entry.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_two_mutations_coalesce_into_one_entry() {
        let repo = setup().await;
        let first = repo
            .enqueue(new_entry(EntityType::Partner, "p-1", json!({ "name": "first" })))
            .await
            .unwrap();

        let mut second = new_entry(EntityType::Partner, "p-1", json!({ "name": "second" }));
        second.operation = Operation::Update;
        let second = repo.enqueue(second).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.coalesced);
        assert_eq!(second.operation, Operation::Create);

        let active = repo.find_active_for_record(EntityType::Partner, "p-1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].payload.body, json!({ "name": "second" }));
        assert_eq!(active[0].payload_revision, 2);
    }

    #[tokio::test]
    async fn test_other_partition_gets_its_own_entry() {
        let repo = setup().await;
        let a = repo.enqueue(order("o-1")).await.unwrap();
        let mut other = order("o-1");
        other.target_partition = PartitionKey::new("porto-cloud");
        let b = repo.enqueue(other).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let repo = setup().await;
        let low = repo.enqueue(order("low")).await.unwrap().id;
        let mut urgent = order("urgent");
        urgent.priority = Priority::High;
        let urgent = repo.enqueue(urgent).await.unwrap().id;
        let normal = repo.enqueue(order("normal")).await.unwrap().id;

        let claimed = claim_ids(&repo, 10).await;
        assert_eq!(claimed, vec![urgent, low, normal]);

        // Everything is now processing
        assert!(claim_ids(&repo, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_partition() {
        let repo = setup().await;
        for i in 0..5 {
            repo.enqueue(order(&format!("o-{i}"))).await.unwrap();
        }
        let mut elsewhere = order("x");
        elsewhere.target_partition = PartitionKey::new("porto-cloud");
        repo.enqueue(elsewhere).await.unwrap();

        assert_eq!(claim_ids(&repo, 3).await.len(), 3);
        assert_eq!(claim_ids(&repo, 3).await.len(), 2);
        assert!(claim_ids(&repo, 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_dependent_entry_waits_for_parent() {
        let repo = setup().await;
        let a = repo
            .enqueue(new_entry(EntityType::Partner, "p-1", json!({})))
            .await
            .unwrap()
            .id;
        let mut b = order("o-1");
        b.depends_on = vec![a];
        let b = repo.enqueue(b).await.unwrap().id;

        let (claimed, token) = claim_one(&repo).await;
        assert_eq!(claimed, a);
        assert!(claim_ids(&repo, 10).await.is_empty());

        repo.mark_synced(a, &token, Some("R-1"), None).await.unwrap();
        assert_eq!(claim_ids(&repo, 10).await, vec![b]);
    }

    #[tokio::test]
    async fn test_dependency_on_unknown_entry_is_dropped() {
        let repo = setup().await;
        let mut entry = order("o-1");
        entry.depends_on = vec![999];
        let id = repo.enqueue(entry).await.unwrap().id;

        assert!(repo.get_required(id).await.unwrap().depends_on.is_empty());
        assert_eq!(claim_ids(&repo, 1).await, vec![id]);
    }

    #[tokio::test]
    async fn test_coalesced_entry_can_depend_on_newer_entry() {
        let repo = setup().await;
        let o = repo.enqueue(order("o-1")).await.unwrap().id;
        let p = repo
            .enqueue(new_entry(EntityType::Partner, "p-1", json!({})))
            .await
            .unwrap()
            .id;
        assert!(p > o);

        let mut update = order("o-1");
        update.operation = Operation::Update;
        update.depends_on = vec![p];
        assert_eq!(repo.enqueue(update).await.unwrap().id, o);

        assert_eq!(repo.get_required(o).await.unwrap().depends_on, vec![p]);
        assert_eq!(claim_ids(&repo, 10).await, vec![p]);
    }

    #[tokio::test]
    async fn test_dependency_closing_a_cycle_is_refused() {
        let repo = setup().await;
        let a = repo
            .enqueue(new_entry(EntityType::Partner, "p-1", json!({})))
            .await
            .unwrap()
            .id;
        let mut b = order("o-1");
        b.depends_on = vec![a];
        let b = repo.enqueue(b).await.unwrap().id;
        let mut c = order("o-2");
        c.depends_on = vec![b];
        let c = repo.enqueue(c).await.unwrap().id;

        // a -> c would close a -> c -> b -> a
        let mut again = new_entry(EntityType::Partner, "p-1", json!({ "v": 2 }));
        again.depends_on = vec![c, a];
        repo.enqueue(again).await.unwrap();

        assert!(repo.get_required(a).await.unwrap().depends_on.is_empty());
        assert_eq!(claim_ids(&repo, 10).await, vec![a]);
    }

    #[tokio::test]
    async fn test_waiting_embedded_entry_links_to_next_parent_entry() {
        let repo = setup().await;
        let mut doc = new_entry(EntityType::AuxiliaryDocument, "d-1", json!({}));
        doc.parent_record_id = Some("o-1".into());
        let doc = repo.enqueue(doc).await.unwrap().id;
        assert!(repo.skip_unresolvable().await.unwrap().is_empty());

        let parent = repo.enqueue(order("o-1")).await.unwrap().id;
        assert_eq!(repo.get_required(doc).await.unwrap().depends_on, vec![parent]);
    }

    #[tokio::test]
    async fn test_failures_back_off_and_freeze_at_max_attempts() {
        let repo = setup().await;
        let mut entry = order("o-1");
        entry.max_attempts = 3;
        let id = repo.enqueue(entry).await.unwrap().id;

        let cap = Duration::minutes(120);
        let mut now = Utc::now();
        let mut previous_retry = now;
        for attempt in 1..=3u32 {
            let claimed = repo.claim_batch_at(&partition(), 10, now).await.unwrap();
            assert_eq!(claimed.len(), 1, "attempt {attempt} should be claimable");

            let token = claimed[0].claim_token.clone().unwrap();
            let schedule = repo
                .mark_error_at(id, &token, &Failure::new(ErrorKind::Transport, "timeout"), cap, now)
                .await
                .unwrap();
            assert_eq!(schedule.attempt_count, attempt);
            assert!(schedule.next_retry_at > previous_retry);
            previous_retry = schedule.next_retry_at;

            // Not claimable before the retry time
            let early = repo.claim_batch_at(&partition(), 10, now).await.unwrap();
            assert!(early.is_empty());

            now = schedule.next_retry_at + Duration::seconds(1);
        }

        let entry = repo.get_required(id).await.unwrap();
        assert_eq!(entry.state, EntryState::Error);
        assert!(entry.is_frozen());

        let far_future = now + Duration::days(365);
        assert!(repo.claim_batch_at(&partition(), 10, far_future).await.unwrap().is_empty());

        repo.reset_to_pending(id).await.unwrap();
        let reset = repo.get_required(id).await.unwrap();
        assert_eq!(reset.attempt_count, 0);
        assert_eq!(reset.error_message, None);
        assert_eq!(claim_ids(&repo, 10).await, vec![id]);
    }

    #[tokio::test]
    async fn test_rejection_records_kind_and_response() {
        let repo = setup().await;
        let id = repo.enqueue(order("o-1")).await.unwrap().id;
        let (_, token) = claim_one(&repo).await;

        let failure = Failure::new(ErrorKind::Rejected, "missing tax id")
            .with_response(r#"{"error":"missing tax id"}"#);
        repo.mark_error(id, &token, &failure, Duration::minutes(120)).await.unwrap();

        let entry = repo.get_required(id).await.unwrap();
        assert_eq!(entry.error_kind, Some(ErrorKind::Rejected));
        assert_eq!(entry.error_message.as_deref(), Some("missing tax id"));
        assert!(entry.last_response_snapshot.is_some());

        let history = repo.attempts(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Rejected);
        assert_eq!(history[0].attempt_number, 1);
    }

    #[tokio::test]
    async fn test_terminal_entries_refuse_transitions() {
        let repo = setup().await;
        let id = repo.enqueue(order("o-1")).await.unwrap().id;
        let (_, token) = claim_one(&repo).await;
        repo.mark_synced(id, &token, Some("R-1"), None).await.unwrap();

        let err = repo
            .mark_error(id, &token, &Failure::new(ErrorKind::Transport, "late"), Duration::minutes(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::InvalidTransition { from: EntryState::Synced, .. }
        ));
        assert!(repo.reset_to_pending(id).await.is_err());
        assert!(repo.skip(id, ErrorKind::Rejected, "no").await.is_err());
    }

    #[tokio::test]
    async fn test_operator_cannot_skip_processing_entry() {
        let repo = setup().await;
        let id = repo.enqueue(order("o-1")).await.unwrap().id;
        let (_, token) = claim_one(&repo).await;

        assert!(matches!(
            repo.skip(id, ErrorKind::Rejected, "operator").await,
            Err(DbError::InvalidTransition { from: EntryState::Processing, .. })
        ));
        repo.abandon(id, &token, ErrorKind::Integrity, "payload unreadable").await.unwrap();
        assert_eq!(repo.get_required(id).await.unwrap().state, EntryState::Skipped);
    }

    #[tokio::test]
    async fn test_mutation_during_flight_requeues_after_ack() {
        let repo = setup().await;
        let id = repo.enqueue(order("o-1")).await.unwrap().id;
        let (_, token) = claim_one(&repo).await;

        let mut newer = new_entry(EntityType::Order, "o-1", json!({ "id": "o-1", "total": 5 }));
        newer.operation = Operation::Update;
        let coalesced = repo.enqueue(newer).await.unwrap();
        assert_eq!(coalesced.id, id);

        let outcome = repo.mark_synced(id, &token, Some("R-9"), None).await.unwrap();
        assert_eq!(outcome, SyncedOutcome::Requeued);

        let entry = repo.get_required(id).await.unwrap();
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(entry.remote_record_id.as_deref(), Some("R-9"));
        assert_eq!(entry.payload.body["total"], 5);
    }

    #[tokio::test]
    async fn test_synced_record_mutated_again_starts_new_entry() {
        let repo = setup().await;
        let first = repo.enqueue(order("o-1")).await.unwrap().id;
        let (_, token) = claim_one(&repo).await;
        repo.mark_synced(first, &token, Some("R-1"), None).await.unwrap();

        let second = repo.enqueue(order("o-1")).await.unwrap();
        assert_ne!(second.id, first);
        assert!(!second.coalesced);
        assert_eq!(
            repo.find_active(EntityType::Order, "o-1", &partition())
                .await
                .unwrap()
                .map(|e| e.id),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn test_reaper_recovers_stuck_processing() {
        let repo = setup().await;
        let id = repo.enqueue(order("o-1")).await.unwrap().id;
        let claimed_at = Utc::now();
        repo.claim_batch_at(&partition(), 1, claimed_at).await.unwrap();

        // Not stale yet
        let none = repo
            .reap_stuck_processing_at(Duration::hours(2), claimed_at + Duration::minutes(30))
            .await
            .unwrap();
        assert!(none.is_empty());

        let reaped = repo
            .reap_stuck_processing_at(Duration::hours(2), claimed_at + Duration::hours(3))
            .await
            .unwrap();
        assert_eq!(reaped, vec![id]);
        assert_eq!(repo.get_required(id).await.unwrap().state, EntryState::Pending);
        assert_eq!(claim_ids(&repo, 1).await, vec![id]);
    }

    #[tokio::test]
    async fn test_outcome_from_reaped_claim_is_refused() {
        let repo = setup().await;
        let id = repo.enqueue(order("o-1")).await.unwrap().id;
        let (_, stale) = claim_one(&repo).await;

        // Reaped before the first holder answers; nobody holds it yet.
        repo.reap_stuck_processing(Duration::zero()).await.unwrap();
        let cap = Duration::minutes(120);
        let late = Failure::new(ErrorKind::Transport, "timeout");
        assert!(matches!(
            repo.mark_error(id, &stale, &late, cap).await,
            Err(DbError::ClaimLost { .. })
        ));

        let (_, current) = claim_one(&repo).await;
        assert_ne!(stale, current);

        assert!(matches!(
            repo.mark_error(id, &stale, &late, cap).await,
            Err(DbError::ClaimLost { .. })
        ));
        assert!(matches!(
            repo.mark_synced(id, &stale, Some("R-1"), None).await,
            Err(DbError::ClaimLost { .. })
        ));
        assert!(matches!(
            repo.abandon(id, &stale, ErrorKind::Integrity, "late").await,
            Err(DbError::ClaimLost { .. })
        ));
        assert!(matches!(
            repo.release(id, &stale, "late").await,
            Err(DbError::ClaimLost { .. })
        ));

        // The current holder's claim is untouched.
        let entry = repo.get_required(id).await.unwrap();
        assert_eq!(entry.state, EntryState::Processing);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.claim_token.as_deref(), Some(current.as_str()));
        assert_eq!(
            repo.mark_synced(id, &current, Some("R-1"), None).await.unwrap(),
            SyncedOutcome::Synced
        );
    }

    #[tokio::test]
    async fn test_release_returns_entry_without_an_attempt() {
        let repo = setup().await;
        let id = repo.enqueue(order("o-1")).await.unwrap().id;
        let (_, token) = claim_one(&repo).await;

        repo.release(id, &token, "worker stopping").await.unwrap();

        let entry = repo.get_required(id).await.unwrap();
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.claim_token, None);
        let history = repo.attempts(id).await.unwrap();
        assert_eq!(history[0].outcome, AttemptOutcome::Requeued);
    }

    #[tokio::test]
    async fn test_purge_removes_old_synced_and_dangling_dependencies() {
        let repo = setup().await;
        let a = repo.enqueue(order("o-1")).await.unwrap().id;
        let (_, token) = claim_one(&repo).await;
        repo.mark_synced(a, &token, None, None).await.unwrap();

        let mut b = new_entry(EntityType::Partner, "p-1", json!({}));
        b.depends_on = vec![a];
        let b = repo.enqueue(b).await.unwrap().id;

        // Too recent to purge
        assert_eq!(repo.purge_synced(Duration::days(28)).await.unwrap(), 0);

        let purged = repo
            .purge_synced_at(Duration::days(28), Utc::now() + Duration::days(29))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(repo.get(a).await.unwrap().is_none());
        assert!(repo.get_required(b).await.unwrap().depends_on.is_empty());
        assert_eq!(claim_ids(&repo, 10).await, vec![b]);
    }

    #[tokio::test]
    async fn test_skipped_dependency_cascades() {
        let repo = setup().await;
        let a = repo
            .enqueue(new_entry(EntityType::Partner, "p-1", json!({})))
            .await
            .unwrap()
            .id;
        let mut b = order("o-1");
        b.depends_on = vec![a];
        let b = repo.enqueue(b).await.unwrap().id;
        let mut c = order("o-2");
        c.depends_on = vec![b];
        let c = repo.enqueue(c).await.unwrap().id;

        repo.skip(a, ErrorKind::Rejected, "bad data").await.unwrap();
        let mut skipped = repo.skip_unresolvable().await.unwrap();
        skipped.sort();
        assert_eq!(skipped, vec![b, c]);

        let entry = repo.get_required(b).await.unwrap();
        assert_eq!(entry.state, EntryState::Skipped);
        assert_eq!(entry.error_kind, Some(ErrorKind::Dependency));
        assert!(entry.error_message.unwrap().contains(&a.to_string()));
    }

    #[tokio::test]
    async fn test_embedded_entry_completes_with_parent() {
        let repo = setup().await;
        let parent = repo.enqueue(order("o-1")).await.unwrap().id;
        let mut doc = new_entry(EntityType::AuxiliaryDocument, "a-1", json!({}));
        doc.depends_on = vec![parent];
        let doc = repo.enqueue(doc).await.unwrap().id;

        // Only the parent is ever dispatched
        let (claimed, token) = claim_one(&repo).await;
        assert_eq!(claimed, parent);
        assert!(claim_ids(&repo, 10).await.is_empty());
        assert!(repo.complete_embedded_with_parent().await.unwrap().is_empty());

        repo.mark_synced(parent, &token, Some("R-1"), None).await.unwrap();
        assert_eq!(repo.complete_embedded_with_parent().await.unwrap(), vec![doc]);
        assert_eq!(repo.get_required(doc).await.unwrap().state, EntryState::Synced);
    }

    #[tokio::test]
    async fn test_embedded_entry_without_parent_is_skipped() {
        let repo = setup().await;
        let doc = repo
            .enqueue(new_entry(EntityType::AuxiliaryDocument, "a-1", json!({})))
            .await
            .unwrap()
            .id;

        assert_eq!(repo.skip_unresolvable().await.unwrap(), vec![doc]);
    }

    #[tokio::test]
    async fn test_list_filters_and_counts() {
        let repo = setup().await;
        repo.enqueue(order("o-1")).await.unwrap();
        repo.enqueue(new_entry(EntityType::Partner, "p-1", json!({}))).await.unwrap();

        let filter = EntryFilter {
            entity_type: Some(EntityType::Partner),
            ..EntryFilter::default()
        };
        let partners = repo.list(&filter).await.unwrap();
        assert_eq!(partners.len(), 1);
        assert_eq!(partners[0].local_record_id, "p-1");

        let counts = repo.count_by_state().await.unwrap();
        assert_eq!(
            counts,
            vec![StateCount {
                partition: partition(),
                state: EntryState::Pending,
                count: 2
            }]
        );
        assert_eq!(repo.count_frozen().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(DbConfig::new(dir.path().join("queue.db")).max_connections(8))
            .await
            .unwrap();
        let repo = db.queue();

        for i in 0..60 {
            repo.enqueue(order(&format!("o-{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..6 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = repo.claim_batch(&partition(), 4).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|e| e.id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "entry {id} claimed twice");
            }
        }
        assert_eq!(total, 60);
    }
}
