//! # Remote Reconciler
//!
//! Decides whether a local record already exists on the central system, so
//! a replayed or crash-recovered submission updates instead of duplicating.
//!
//! ## Matching Policy (first match wins)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Business key (tax id)                                              │
//! │       local mapping sharing the key ──► its remote id                  │
//! │       else directory lookup ──────────► first candidate                │
//! │                                                                         │
//! │  2. Stored remote id for this record (mapping or entry)                │
//! │       kept only if the directory still knows it                        │
//! │                                                                         │
//! │  3. Legacy id + name/contact corroboration                             │
//! │  4. Natural key (email) + name/contact corroboration                   │
//! │       local mappings first, then directory candidates                  │
//! │                                                                         │
//! │  5. Nothing ──► New                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The same policy runs in reverse for inbound records
//! ([`RemoteReconciler::reconcile_inbound`]), which never overwrites a record
//! that still has local changes queued.

use std::sync::Arc;

use tracing::{debug, info};

use harbor_core::{EntityType, IdentityProbe, MatchedBy, QueueEntry, RemoteIdentityMapping};
use harbor_db::{IdentityRepository, QueueRepository};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{LookupKey, RemoteCandidate};
use crate::transport::RemoteDirectory;

/// Outcome of matching an outgoing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Matched {
        remote_record_id: String,
        matched_by: MatchedBy,
    },
    New,
}

impl Resolution {
    pub fn remote_record_id(&self) -> Option<&str> {
        match self {
            Resolution::Matched {
                remote_record_id, ..
            } => Some(remote_record_id),
            Resolution::New => None,
        }
    }
}

/// What to do with a record arriving from the central system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDecision {
    /// Overwrite this local record.
    Apply {
        local_record_id: String,
        matched_by: MatchedBy,
    },
    /// No local counterpart; create one.
    CreateLocal,
    /// The local record has unsynced changes queued; leave it alone.
    Deferred {
        local_record_id: String,
        entry_id: i64,
    },
}

pub struct RemoteReconciler {
    identities: IdentityRepository,
    queue: QueueRepository,
    directory: Arc<dyn RemoteDirectory>,
}

impl RemoteReconciler {
    pub fn new(
        identities: IdentityRepository,
        queue: QueueRepository,
        directory: Arc<dyn RemoteDirectory>,
    ) -> Self {
        RemoteReconciler {
            identities,
            queue,
            directory,
        }
    }

    // =========================================================================
    // Outgoing
    // =========================================================================

    /// Applies the matching policy to a claimed entry.
    pub async fn resolve(&self, endpoint: &str, entry: &QueueEntry) -> SyncResult<Resolution> {
        let entity_type = entry.entity_type;
        let probe = &entry.identity;

        // 1. Business key
        if let Some(key) = probe.business_key() {
            if let Some(mapping) = self.identities.find_by_business_key(entity_type, key).await? {
                if let Some(remote) = mapping.remote_record_id {
                    return Ok(matched(remote, MatchedBy::BusinessKey, entry));
                }
            }
            let found = self
                .lookup(endpoint, entity_type, LookupKey::BusinessKey(key.to_string()))
                .await?;
            if let Some(candidate) = found.into_iter().next() {
                return Ok(matched(candidate.remote_record_id, MatchedBy::BusinessKey, entry));
            }
        }

        // 2. Stored remote id
        let stored = match self.identities.get(entity_type, &entry.local_record_id).await? {
            Some(mapping) => mapping.remote_record_id,
            None => None,
        }
        .or_else(|| entry.remote_record_id.clone());
        if let Some(remote) = stored {
            let found = self
                .lookup(endpoint, entity_type, LookupKey::RemoteId(remote.clone()))
                .await?;
            if found.iter().any(|c| c.remote_record_id == remote) {
                return Ok(matched(remote, MatchedBy::StoredMapping, entry));
            }
            info!(
                entry_id = entry.id,
                remote_record_id = %remote,
                "Stored remote id no longer exists remotely"
            );
        }

        // 3. Legacy id, corroborated
        if let Some(legacy) = probe.legacy_id() {
            let local = self.identities.find_by_legacy_id(entity_type, legacy).await?;
            if let Some(remote) = corroborated_mapping(probe, &entry.local_record_id, local) {
                return Ok(matched(remote, MatchedBy::LegacyIdentifier, entry));
            }
            let found = self
                .lookup(endpoint, entity_type, LookupKey::LegacyId(legacy.to_string()))
                .await?;
            if let Some(remote) = corroborated_candidate(probe, found) {
                return Ok(matched(remote, MatchedBy::LegacyIdentifier, entry));
            }
        }

        // 4. Natural key, corroborated
        if let Some(natural) = probe.natural_key() {
            let local = self.identities.find_by_natural_key(entity_type, natural).await?;
            if let Some(remote) = corroborated_mapping(probe, &entry.local_record_id, local) {
                return Ok(matched(remote, MatchedBy::NaturalKey, entry));
            }
            let found = self
                .lookup(endpoint, entity_type, LookupKey::NaturalKey(natural.to_string()))
                .await?;
            if let Some(remote) = corroborated_candidate(probe, found) {
                return Ok(matched(remote, MatchedBy::NaturalKey, entry));
            }
        }

        debug!(entry_id = entry.id, "No remote counterpart; treating as new");
        Ok(Resolution::New)
    }

    /// Persists the mapping after a confirmed create or match.
    pub async fn record_mapping(
        &self,
        entry: &QueueEntry,
        remote_record_id: Option<&str>,
    ) -> SyncResult<RemoteIdentityMapping> {
        Ok(self
            .identities
            .record(
                entry.entity_type,
                &entry.local_record_id,
                remote_record_id,
                &entry.identity,
            )
            .await?)
    }

    async fn lookup(
        &self,
        endpoint: &str,
        entity_type: EntityType,
        key: LookupKey,
    ) -> SyncResult<Vec<RemoteCandidate>> {
        let kind = key.kind();
        self.directory
            .lookup(endpoint, entity_type, key)
            .await
            .map_err(|e| match e {
                SyncError::LookupFailed(_) => e,
                other => SyncError::LookupFailed(format!("{kind} lookup: {other}")),
            })
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Maps a record arriving from the central system onto a local record.
    ///
    /// Callers apply the data under a suppressed
    /// [`SyncContext`](crate::gateway::SyncContext) so the write is not queued
    /// back out.
    pub async fn reconcile_inbound(
        &self,
        entity_type: EntityType,
        remote_record_id: &str,
        identity: &IdentityProbe,
    ) -> SyncResult<InboundDecision> {
        let Some((mapping, matched_by)) = self
            .find_local(entity_type, remote_record_id, identity)
            .await?
        else {
            debug!(entity_type = %entity_type, remote_record_id, "Inbound record is new locally");
            return Ok(InboundDecision::CreateLocal);
        };

        let local_record_id = mapping.local_record_id;
        let active = self
            .queue
            .find_active_for_record(entity_type, &local_record_id)
            .await?;
        if let Some(entry) = active.first() {
            info!(
                entity_type = %entity_type,
                local_record_id = %local_record_id,
                entry_id = entry.id,
                "Inbound update deferred; local changes pending"
            );
            return Ok(InboundDecision::Deferred {
                local_record_id,
                entry_id: entry.id,
            });
        }

        self.identities
            .record(entity_type, &local_record_id, Some(remote_record_id), identity)
            .await?;
        Ok(InboundDecision::Apply {
            local_record_id,
            matched_by,
        })
    }

    async fn find_local(
        &self,
        entity_type: EntityType,
        remote_record_id: &str,
        identity: &IdentityProbe,
    ) -> SyncResult<Option<(RemoteIdentityMapping, MatchedBy)>> {
        if let Some(key) = identity.business_key() {
            if let Some(mapping) = self.identities.find_by_business_key(entity_type, key).await? {
                return Ok(Some((mapping, MatchedBy::BusinessKey)));
            }
        }
        if let Some(mapping) = self
            .identities
            .find_by_remote_id(entity_type, remote_record_id)
            .await?
        {
            return Ok(Some((mapping, MatchedBy::StoredMapping)));
        }
        if let Some(legacy) = identity.legacy_id() {
            let candidates = self.identities.find_by_legacy_id(entity_type, legacy).await?;
            if let Some(mapping) = first_corroborated(identity, candidates) {
                return Ok(Some((mapping, MatchedBy::LegacyIdentifier)));
            }
        }
        if let Some(natural) = identity.natural_key() {
            let candidates = self.identities.find_by_natural_key(entity_type, natural).await?;
            if let Some(mapping) = first_corroborated(identity, candidates) {
                return Ok(Some((mapping, MatchedBy::NaturalKey)));
            }
        }
        Ok(None)
    }
}

fn matched(remote_record_id: String, matched_by: MatchedBy, entry: &QueueEntry) -> Resolution {
    debug!(
        entry_id = entry.id,
        remote_record_id = %remote_record_id,
        matched_by = %matched_by,
        "Matched remote counterpart"
    );
    Resolution::Matched {
        remote_record_id,
        matched_by,
    }
}

fn first_corroborated(
    probe: &IdentityProbe,
    candidates: Vec<RemoteIdentityMapping>,
) -> Option<RemoteIdentityMapping> {
    candidates.into_iter().find(|m| {
        probe.corroborates(m.identity.name.as_deref(), m.identity.contact.as_deref())
    })
}

/// Remote id of a corroborated mapping belonging to another local record
/// (the record's own mapping is rule 2's business).
fn corroborated_mapping(
    probe: &IdentityProbe,
    local_record_id: &str,
    candidates: Vec<RemoteIdentityMapping>,
) -> Option<String> {
    let others = candidates
        .into_iter()
        .filter(|m| m.local_record_id != local_record_id)
        .collect();
    first_corroborated(probe, others).and_then(|m| m.remote_record_id)
}

fn corroborated_candidate(probe: &IdentityProbe, candidates: Vec<RemoteCandidate>) -> Option<String> {
    candidates
        .into_iter()
        .find(|c| probe.corroborates(c.name.as_deref(), c.contact.as_deref()))
        .map(|c| c.remote_record_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCentral;
    use harbor_core::{Operation, PartitionKey, Payload, Priority};
    use harbor_db::{Database, DbConfig, NewEntry};

    struct Fixture {
        db: Database,
        central: Arc<FakeCentral>,
        reconciler: RemoteReconciler,
    }

    async fn setup() -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let central = Arc::new(FakeCentral::default());
        let reconciler = RemoteReconciler::new(db.identities(), db.queue(), central.clone());
        Fixture {
            db,
            central,
            reconciler,
        }
    }

    fn probe(tax_id: Option<&str>, legacy: Option<&str>, email: Option<&str>, name: &str) -> IdentityProbe {
        IdentityProbe {
            business_key: tax_id.map(Into::into),
            legacy_id: legacy.map(Into::into),
            natural_key: email.map(Into::into),
            name: Some(name.into()),
            contact: None,
        }
    }

    async fn entry(db: &Database, local_id: &str, identity: IdentityProbe) -> QueueEntry {
        let queued = db
            .queue()
            .enqueue(NewEntry {
                entity_type: EntityType::Partner,
                local_record_id: local_id.into(),
                human_reference: local_id.into(),
                operation: Operation::Create,
                payload: Payload::new(serde_json::json!({"id": local_id})),
                target_partition: PartitionKey::new("lisbon-cloud"),
                priority: Priority::Normal,
                depends_on: Vec::new(),
                identity,
                parent_record_id: None,
                max_attempts: 5,
            })
            .await
            .unwrap();
        db.queue().get_required(queued.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_business_key_found_remotely() {
        let f = setup().await;
        let remote = f
            .central
            .seed(EntityType::Partner, probe(Some("PT1"), None, None, "Ana"));
        let e = entry(&f.db, "p-1", probe(Some("PT1"), None, None, "Someone Else")).await;

        let resolution = f.reconciler.resolve("ws://central", &e).await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Matched {
                remote_record_id: remote,
                matched_by: MatchedBy::BusinessKey
            }
        );
    }

    #[tokio::test]
    async fn test_stored_mapping_must_still_exist_remotely() {
        let f = setup().await;
        let remote = f
            .central
            .seed(EntityType::Partner, probe(None, None, None, "Ana"));
        let e = entry(&f.db, "p-1", probe(None, None, None, "Ana")).await;
        f.reconciler.record_mapping(&e, Some(&remote)).await.unwrap();

        let resolution = f.reconciler.resolve("ws://central", &e).await.unwrap();
        assert_eq!(resolution.remote_record_id(), Some(remote.as_str()));

        f.central.forget(&remote);
        assert_eq!(f.reconciler.resolve("ws://central", &e).await.unwrap(), Resolution::New);
    }

    #[tokio::test]
    async fn test_legacy_id_alone_never_matches() {
        let f = setup().await;
        f.central
            .seed(EntityType::Partner, probe(None, Some("L-9"), None, "Ana Silva"));

        let stranger = entry(&f.db, "p-1", probe(None, Some("L-9"), None, "Bruno")).await;
        assert_eq!(
            f.reconciler.resolve("ws://central", &stranger).await.unwrap(),
            Resolution::New
        );

        let same = entry(&f.db, "p-2", probe(None, Some("L-9"), None, "ana silva")).await;
        let resolution = f.reconciler.resolve("ws://central", &same).await.unwrap();
        assert!(matches!(
            resolution,
            Resolution::Matched {
                matched_by: MatchedBy::LegacyIdentifier,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_natural_key_matches_local_mapping_first() {
        let f = setup().await;
        let first = entry(&f.db, "p-1", probe(None, None, Some("ana@example.com"), "Ana")).await;
        f.reconciler.record_mapping(&first, Some("R-LOCAL")).await.unwrap();

        let twin = entry(&f.db, "p-2", probe(None, None, Some("ana@example.com"), "Ana")).await;
        let resolution = f.reconciler.resolve("ws://central", &twin).await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Matched {
                remote_record_id: "R-LOCAL".into(),
                matched_by: MatchedBy::NaturalKey
            }
        );
        assert_eq!(f.central.lookups(), 0);
    }

    #[tokio::test]
    async fn test_directory_failure_is_lookup_error() {
        let f = setup().await;
        f.central.fail_lookups(true);
        let e = entry(&f.db, "p-1", probe(Some("PT1"), None, None, "Ana")).await;

        let err = f.reconciler.resolve("ws://central", &e).await.unwrap_err();
        assert!(matches!(err, SyncError::LookupFailed(_)));
    }

    #[tokio::test]
    async fn test_inbound_defers_while_local_changes_pending() {
        let f = setup().await;
        let e = entry(&f.db, "p-1", probe(Some("PT1"), None, None, "Ana")).await;
        f.reconciler.record_mapping(&e, Some("R-1")).await.unwrap();

        let decision = f
            .reconciler
            .reconcile_inbound(EntityType::Partner, "R-1", &IdentityProbe::default())
            .await
            .unwrap();
        assert_eq!(
            decision,
            InboundDecision::Deferred {
                local_record_id: "p-1".into(),
                entry_id: e.id
            }
        );

        f.db.queue()
            .skip(e.id, harbor_core::ErrorKind::Operator, "test")
            .await
            .unwrap();
        let decision = f
            .reconciler
            .reconcile_inbound(EntityType::Partner, "R-1", &IdentityProbe::default())
            .await
            .unwrap();
        assert_eq!(
            decision,
            InboundDecision::Apply {
                local_record_id: "p-1".into(),
                matched_by: MatchedBy::StoredMapping
            }
        );
    }

    #[tokio::test]
    async fn test_inbound_unknown_record_is_created_locally() {
        let f = setup().await;
        let decision = f
            .reconciler
            .reconcile_inbound(
                EntityType::Partner,
                "R-404",
                &probe(Some("PT9"), None, None, "Carla"),
            )
            .await
            .unwrap();
        assert_eq!(decision, InboundDecision::CreateLocal);
    }
}
