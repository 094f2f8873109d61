//! # Sync Protocol Messages
//!
//! JSON messages exchanged with the central sync endpoint.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Protocol Messages                             │
//! │                                                                         │
//! │  SUBMISSION (branch → central)                                         │
//! │  ─────────────────────────────                                         │
//! │  BRANCH  ───► Submit { request_id, device_id, entries: [...] }         │
//! │  CENTRAL ◄─── SubmitAck { request_id, results: [...] }                 │
//! │                                                                         │
//! │  IDENTITY LOOKUP (reconciliation)                                      │
//! │  ────────────────────────────────                                      │
//! │  BRANCH  ───► Lookup { request_id, entity_type, key }                  │
//! │  CENTRAL ◄─── LookupResult { request_id, candidates: [...] }           │
//! │                                                                         │
//! │  ERROR                                                                 │
//! │  ─────                                                                 │
//! │  CENTRAL ◄─── Error { request_id?, code, message }                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "Submit", "payload": { "requestId": "...", "entries": [ ... ] } }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use harbor_core::{EntityType, Operation};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SyncMessage {
    Submit(SubmitPayload),
    SubmitAck(SubmitAckPayload),
    Lookup(LookupPayload),
    LookupResult(LookupResultPayload),
    Error(ErrorPayload),
}

// =============================================================================
// Submission
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPayload {
    pub request_id: Uuid,
    pub device_id: String,
    pub protocol_version: u32,
    pub entries: Vec<WireEntry>,
}

/// One queue entry on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEntry {
    pub entry_id: i64,
    pub entity_type: EntityType,
    pub local_record_id: String,
    pub operation: Operation,
    /// Known remote id; present means "update this record", absent "create".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_record_id: Option<String>,
    /// Lets the receiver drop a replay of an older snapshot.
    pub revision: i64,
    pub payload_version: u32,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAckPayload {
    pub request_id: Uuid,
    pub results: Vec<WireResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireStatus {
    Accepted,
    Rejected,
    /// Central side failed transiently (storage busy, downstream timeout).
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResult {
    pub entry_id: i64,
    pub status: WireStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// =============================================================================
// Lookup
// =============================================================================

/// Key the remote directory is searched by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LookupKey {
    BusinessKey(String),
    LegacyId(String),
    NaturalKey(String),
    RemoteId(String),
}

impl LookupKey {
    pub fn kind(&self) -> &'static str {
        match self {
            LookupKey::BusinessKey(_) => "business_key",
            LookupKey::LegacyId(_) => "legacy_id",
            LookupKey::NaturalKey(_) => "natural_key",
            LookupKey::RemoteId(_) => "remote_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupPayload {
    pub request_id: Uuid,
    pub entity_type: EntityType,
    pub key: LookupKey,
}

/// A remote record that might be the counterpart of a local one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCandidate {
    pub remote_record_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResultPayload {
    pub request_id: Uuid,
    pub candidates: Vec<RemoteCandidate>,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default)]
    pub request_id: Option<Uuid>,
    pub code: String,
    pub message: String,
}

// =============================================================================
// Helpers
// =============================================================================

impl SyncMessage {
    /// Returns the message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Submit(_) => "Submit",
            SyncMessage::SubmitAck(_) => "SubmitAck",
            SyncMessage::Lookup(_) => "Lookup",
            SyncMessage::LookupResult(_) => "LookupResult",
            SyncMessage::Error(_) => "Error",
        }
    }

    /// Request this message belongs to, if it carries one.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            SyncMessage::Submit(p) => Some(p.request_id),
            SyncMessage::SubmitAck(p) => Some(p.request_id),
            SyncMessage::Lookup(p) => Some(p.request_id),
            SyncMessage::LookupResult(p) => Some(p.request_id),
            SyncMessage::Error(p) => p.request_id,
        }
    }

    pub fn submit(device_id: &str, entries: Vec<WireEntry>) -> Self {
        SyncMessage::Submit(SubmitPayload {
            request_id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            protocol_version: PROTOCOL_VERSION,
            entries,
        })
    }

    pub fn lookup(entity_type: EntityType, key: LookupKey) -> Self {
        SyncMessage::Lookup(LookupPayload {
            request_id: Uuid::new_v4(),
            entity_type,
            key,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_wire_shape() {
        let msg = SyncMessage::submit(
            "register-1",
            vec![WireEntry {
                entry_id: 7,
                entity_type: EntityType::Partner,
                local_record_id: "p-1".into(),
                operation: Operation::Create,
                remote_record_id: None,
                revision: 2,
                payload_version: 1,
                payload: serde_json::json!({"name": "Ana"}),
            }],
        );
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"Submit""#));
        assert!(json.contains(r#""entryId":7"#));
        assert!(!json.contains("remoteRecordId"));

        let back = SyncMessage::from_json(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_parse_ack_from_central() {
        let json = r#"{
            "type": "SubmitAck",
            "payload": {
                "requestId": "6f1c1d52-8f1e-4a36-9d57-2a2b0f0c1e11",
                "results": [
                    {"entryId": 1, "status": "accepted", "remoteRecordId": "R-9"},
                    {"entryId": 2, "status": "rejected", "reason": "vat invalid"}
                ]
            }
        }"#;
        let SyncMessage::SubmitAck(ack) = SyncMessage::from_json(json).unwrap() else {
            panic!("expected SubmitAck");
        };
        assert_eq!(ack.results[0].remote_record_id.as_deref(), Some("R-9"));
        assert_eq!(ack.results[1].status, WireStatus::Rejected);
    }

    #[test]
    fn test_lookup_key_is_tagged() {
        let msg = SyncMessage::lookup(EntityType::Partner, LookupKey::BusinessKey("PT1".into()));
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""kind":"business_key""#));
        assert_eq!(msg.type_name(), "Lookup");
        assert!(msg.request_id().is_some());
    }
}
