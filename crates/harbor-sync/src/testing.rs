//! In-memory stand-in for the central system, shared by the unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use harbor_core::{
    EntityType, IdentityProbe, Operation, OrderRecord, PartnerRecord, SyncRecord,
};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{LookupKey, RemoteCandidate};
use crate::transport::{RemoteDirectory, Submission, SubmitOutcome, SubmitResult, SyncTransport};

#[derive(Default)]
struct State {
    records: BTreeMap<String, (EntityType, IdentityProbe)>,
    next_id: u64,
    lookups: usize,
    submitted: Vec<Submission>,
    fail_lookups: bool,
    down: bool,
    rejected: HashSet<String>,
    delay: Option<Duration>,
}

/// Remote store + directory. Creates get ids `R-1`, `R-2`, ...
#[derive(Default)]
pub struct FakeCentral {
    state: Mutex<State>,
}

impl FakeCentral {
    pub fn seed(&self, entity_type: EntityType, identity: IdentityProbe) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("R-{}", state.next_id);
        state.records.insert(id.clone(), (entity_type, identity));
        id
    }

    pub fn forget(&self, remote_id: &str) {
        self.state.lock().unwrap().records.remove(remote_id);
    }

    pub fn lookups(&self) -> usize {
        self.state.lock().unwrap().lookups
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.state.lock().unwrap().fail_lookups = fail;
    }

    /// Simulates an unreachable endpoint.
    pub fn set_down(&self, down: bool) {
        self.state.lock().unwrap().down = down;
    }

    /// Every submit of this local record is refused.
    pub fn reject(&self, local_record_id: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected
            .insert(local_record_id.to_string());
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn submitted(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn remote_count(&self, entity_type: EntityType) -> usize {
        self.state
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|(t, _)| *t == entity_type)
            .count()
    }
}

fn identity_of(submission: &Submission) -> IdentityProbe {
    match submission.entity_type {
        EntityType::Partner => submission
            .payload
            .decode::<PartnerRecord>()
            .map(|r| r.identity())
            .unwrap_or_default(),
        EntityType::Order => submission
            .payload
            .decode::<OrderRecord>()
            .map(|r| r.identity())
            .unwrap_or_default(),
        EntityType::AuxiliaryDocument => IdentityProbe::default(),
    }
}

#[async_trait]
impl SyncTransport for FakeCentral {
    async fn submit(
        &self,
        _endpoint: &str,
        submissions: Vec<Submission>,
    ) -> SyncResult<Vec<SubmitResult>> {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.down {
            return Err(SyncError::ConnectionFailed("connection refused".into()));
        }

        let mut results = Vec::new();
        for s in submissions {
            state.submitted.push(s.clone());
            if state.rejected.contains(&s.local_record_id) {
                results.push(SubmitResult::new(
                    s.entry_id,
                    SubmitOutcome::Rejected("validation failed".into()),
                ));
                continue;
            }
            let remote = match (s.operation, s.remote_record_id.clone()) {
                (Operation::Delete, Some(id)) => {
                    state.records.remove(&id);
                    id
                }
                (_, Some(id)) => {
                    state.records.insert(id.clone(), (s.entity_type, identity_of(&s)));
                    id
                }
                (_, None) => {
                    state.next_id += 1;
                    let id = format!("R-{}", state.next_id);
                    state.records.insert(id.clone(), (s.entity_type, identity_of(&s)));
                    id
                }
            };
            results.push(SubmitResult::new(s.entry_id, SubmitOutcome::Ack(Some(remote))));
        }
        Ok(results)
    }
}

#[async_trait]
impl RemoteDirectory for FakeCentral {
    async fn lookup(
        &self,
        _endpoint: &str,
        entity_type: EntityType,
        key: LookupKey,
    ) -> SyncResult<Vec<RemoteCandidate>> {
        let mut state = self.state.lock().unwrap();
        state.lookups += 1;
        if state.fail_lookups {
            return Err(SyncError::LookupFailed("directory offline".into()));
        }

        let candidates = state
            .records
            .iter()
            .filter(|(_, (t, _))| *t == entity_type)
            .filter(|(id, (_, identity))| match &key {
                LookupKey::BusinessKey(k) => identity.business_key() == Some(k.as_str()),
                LookupKey::LegacyId(k) => identity.legacy_id() == Some(k.as_str()),
                LookupKey::NaturalKey(k) => identity.natural_key() == Some(k.as_str()),
                LookupKey::RemoteId(k) => *id == k,
            })
            .map(|(id, (_, identity))| RemoteCandidate {
                remote_record_id: id.clone(),
                name: identity.name.clone(),
                contact: identity.contact.clone(),
            })
            .collect();
        Ok(candidates)
    }
}
