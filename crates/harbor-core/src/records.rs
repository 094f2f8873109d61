//! # Synchronized Records
//!
//! The [`SyncRecord`] trait is the only thing the queue knows about business
//! entities. Each variant of [`EntityType`] has exactly one implementor here,
//! so serialization and identity extraction are resolved at compile time.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  OrderRecord ─────────────► EntityType::Order                           │
//! │     │ references partner                                                │
//! │     ▼                                                                   │
//! │  PartnerRecord ───────────► EntityType::Partner                         │
//! │                                                                         │
//! │  AuxiliaryDocumentRecord ─► EntityType::AuxiliaryDocument               │
//! │     │ embedded in order (never dispatched alone)                        │
//! │     ▼                                                                   │
//! │  OrderRecord                                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::identity::IdentityProbe;
use crate::types::{EntityType, Payload, Priority};

// =============================================================================
// SyncRecord Trait
// =============================================================================

/// A reference from one synchronized record to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub entity_type: EntityType,
    pub local_id: String,
}

impl RecordRef {
    pub fn new(entity_type: EntityType, local_id: impl Into<String>) -> Self {
        RecordRef {
            entity_type,
            local_id: local_id.into(),
        }
    }
}

/// A business record that replicates through the queue.
pub trait SyncRecord: Serialize {
    /// Variant tag for this record kind.
    const ENTITY_TYPE: EntityType;

    fn local_id(&self) -> String;

    /// Operator-facing label.
    fn human_reference(&self) -> String;

    /// Owning branch, used to resolve the target partition.
    fn branch_id(&self) -> Option<&str>;

    /// Drain tier derived from the record's own state.
    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Other synchronized records this one points at.
    fn references(&self) -> Vec<RecordRef> {
        Vec::new()
    }

    /// Attributes the reconciler matches on.
    fn identity(&self) -> IdentityProbe {
        IdentityProbe::default()
    }

    /// Full snapshot stored as the entry payload.
    fn snapshot(&self) -> Result<Payload, SnapshotError> {
        serde_json::to_value(self)
            .map(Payload::new)
            .map_err(|e| SnapshotError::Unserializable {
                entity_type: Self::ENTITY_TYPE.to_string(),
                local_id: self.local_id(),
                reason: e.to_string(),
            })
    }
}

// =============================================================================
// Order
// =============================================================================

/// Lifecycle of a point-of-sale order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Draft,
    Paid,
    Invoiced,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub sku: String,
    pub description: String,
    /// Quantity in thousandths (weighed goods).
    pub quantity_milli: i64,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    /// Receipt number printed for the customer, unique per branch.
    pub reference: String,
    pub branch_id: Option<String>,
    pub status: OrderStatus,
    pub partner_id: Option<String>,
    pub lines: Vec<OrderLine>,
    /// Payment artifacts replicated inside this order's snapshot.
    #[serde(default)]
    pub auxiliary_documents: Vec<AuxiliaryDocumentRecord>,
    pub total_cents: i64,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord for OrderRecord {
    const ENTITY_TYPE: EntityType = EntityType::Order;

    fn local_id(&self) -> String {
        self.id.clone()
    }

    fn human_reference(&self) -> String {
        self.reference.clone()
    }

    fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }

    /// Finalized sales outrank drafts.
    fn priority(&self) -> Priority {
        match self.status {
            OrderStatus::Paid | OrderStatus::Invoiced => Priority::High,
            OrderStatus::Cancelled => Priority::Normal,
            OrderStatus::Draft => Priority::Low,
        }
    }

    fn references(&self) -> Vec<RecordRef> {
        self.partner_id
            .iter()
            .map(|id| RecordRef::new(EntityType::Partner, id.clone()))
            .collect()
    }

    fn identity(&self) -> IdentityProbe {
        IdentityProbe {
            business_key: Some(format!(
                "{}/{}",
                self.branch_id.as_deref().unwrap_or("-"),
                self.reference
            )),
            ..IdentityProbe::default()
        }
    }
}

// =============================================================================
// Partner
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerRecord {
    pub id: String,
    pub name: String,
    pub tax_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Identifier from the system this partner was migrated from.
    pub legacy_id: Option<String>,
    pub branch_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord for PartnerRecord {
    const ENTITY_TYPE: EntityType = EntityType::Partner;

    fn local_id(&self) -> String {
        self.id.clone()
    }

    fn human_reference(&self) -> String {
        self.name.clone()
    }

    fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }

    fn identity(&self) -> IdentityProbe {
        IdentityProbe {
            business_key: self.tax_id.clone(),
            legacy_id: self.legacy_id.clone(),
            natural_key: self.email.as_ref().map(|e| e.trim().to_lowercase()),
            name: Some(self.name.clone()),
            contact: self.phone.clone(),
        }
    }
}

// =============================================================================
// Auxiliary Document
// =============================================================================

/// Card slip, voucher or similar artifact that travels inside its order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryDocumentRecord {
    pub id: String,
    pub order_id: String,
    pub branch_id: Option<String>,
    pub kind: String,
    pub amount_cents: i64,
    pub reference: Option<String>,
}

impl SyncRecord for AuxiliaryDocumentRecord {
    const ENTITY_TYPE: EntityType = EntityType::AuxiliaryDocument;

    fn local_id(&self) -> String {
        self.id.clone()
    }

    fn human_reference(&self) -> String {
        match &self.reference {
            Some(r) => format!("{} {}", self.kind, r),
            None => format!("{} for order {}", self.kind, self.order_id),
        }
    }

    fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }

    fn references(&self) -> Vec<RecordRef> {
        vec![RecordRef::new(EntityType::Order, self.order_id.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(status: OrderStatus) -> OrderRecord {
        OrderRecord {
            id: "o-1".into(),
            reference: "0001-000042".into(),
            branch_id: Some("lisbon".into()),
            status,
            partner_id: Some("p-9".into()),
            lines: vec![OrderLine {
                sku: "COF-250".into(),
                description: "Coffee beans 250g".into(),
                quantity_milli: 2000,
                unit_price_cents: 899,
            }],
            auxiliary_documents: Vec::new(),
            total_cents: 1798,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_paid_order_outranks_draft() {
        assert!(order(OrderStatus::Paid).priority() > order(OrderStatus::Draft).priority());
    }

    #[test]
    fn test_order_references_partner() {
        assert_eq!(
            order(OrderStatus::Paid).references(),
            vec![RecordRef::new(EntityType::Partner, "p-9")]
        );
    }

    #[test]
    fn test_snapshot_round_trips_through_payload() {
        let original = order(OrderStatus::Invoiced);
        let payload = original.snapshot().unwrap();
        let decoded: OrderRecord = payload.decode().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_partner_identity_normalizes_email() {
        let partner = PartnerRecord {
            id: "p-1".into(),
            name: "Ana Silva".into(),
            tax_id: Some("PT123456789".into()),
            email: Some(" Ana@Example.com ".into()),
            phone: None,
            legacy_id: None,
            branch_id: None,
            updated_at: Utc::now(),
        };
        let probe = partner.identity();
        assert_eq!(probe.natural_key(), Some("ana@example.com"));
        assert_eq!(probe.business_key(), Some("PT123456789"));
    }

    #[test]
    fn test_auxiliary_document_points_at_its_order() {
        let doc = AuxiliaryDocumentRecord {
            id: "a-1".into(),
            order_id: "o-1".into(),
            branch_id: None,
            kind: "card_slip".into(),
            amount_cents: 1798,
            reference: None,
        };
        let refs = doc.references();
        assert_eq!(refs[0].entity_type, AuxiliaryDocumentRecord::ENTITY_TYPE.embedded_in().unwrap());
    }
}
