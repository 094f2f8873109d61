//! # Remote Identity
//!
//! Identifying attributes the reconciler matches on, and the persisted
//! mapping between a local record and its remote counterpart.
//!
//! ## Matching Strength
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. business_key          alone is enough (tax id)                      │
//! │  2. stored remote id      alone is enough                               │
//! │  3. legacy_id             needs name or contact to corroborate          │
//! │  4. natural_key (email)   needs name or contact to corroborate          │
//! │  5. nothing               new record                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::EntityType;

/// Identifying attributes of a local record, captured at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProbe {
    /// Durable external business identifier (tax id, fiscal number).
    pub business_key: Option<String>,
    /// Identifier carried over from a data migration.
    pub legacy_id: Option<String>,
    /// Secondary unique natural key, usually an email address.
    pub natural_key: Option<String>,
    pub name: Option<String>,
    /// Phone or other contact handle.
    pub contact: Option<String>,
}

impl IdentityProbe {
    /// Business key, if present and non-blank.
    pub fn business_key(&self) -> Option<&str> {
        non_blank(&self.business_key)
    }

    pub fn legacy_id(&self) -> Option<&str> {
        non_blank(&self.legacy_id)
    }

    pub fn natural_key(&self) -> Option<&str> {
        non_blank(&self.natural_key)
    }

    /// Returns true if a candidate shares a name or contact with this probe.
    ///
    /// Comparison ignores case and surrounding whitespace. Blank values never
    /// corroborate anything.
    pub fn corroborates(&self, name: Option<&str>, contact: Option<&str>) -> bool {
        fields_match(non_blank(&self.name), name) || fields_match(non_blank(&self.contact), contact)
    }

    /// True when nothing identifying was captured.
    pub fn is_empty(&self) -> bool {
        self.business_key().is_none()
            && self.legacy_id().is_none()
            && self.natural_key().is_none()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn fields_match(ours: Option<&str>, theirs: Option<&str>) -> bool {
    match (ours, theirs.map(str::trim).filter(|v| !v.is_empty())) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

/// Which rule of the matching policy produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    BusinessKey,
    StoredMapping,
    LegacyIdentifier,
    NaturalKey,
}

impl std::fmt::Display for MatchedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MatchedBy::BusinessKey => "business_key",
            MatchedBy::StoredMapping => "stored_mapping",
            MatchedBy::LegacyIdentifier => "legacy_identifier",
            MatchedBy::NaturalKey => "natural_key",
        };
        f.write_str(s)
    }
}

/// Association between a local record and what the remote knows it by.
///
/// Created on first successful reconciliation, refreshed on every later sync,
/// never deleted automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteIdentityMapping {
    pub entity_type: EntityType,
    pub local_record_id: String,
    pub remote_record_id: Option<String>,
    pub identity: IdentityProbe,
    pub first_synced_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
