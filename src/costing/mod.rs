//! Pure, storage-free core of the costing engine: FIFO layer selection,
//! landed-cost allocation math, valuation rollups, and drift classification.
//! Everything here is deterministic and unit-tested without a database; the
//! services layer owns transactions and persistence.

pub mod fifo;
pub mod integrity;
pub mod landed_cost;
pub mod valuation;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::layer_audit_entry::AuditAction;

/// Read-side projection of one cost layer, the unit the FIFO walk operates
/// on. Sorted by (`received_at`, `sequence`) — the sequence tiebreak keeps
/// FIFO deterministic when timestamps collide at persisted precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerView {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub sequence: i64,
    pub quantity_remaining: Decimal,
    pub unit_cost: Decimal,
}

impl LayerView {
    pub fn remaining_value(&self) -> Decimal {
        self.quantity_remaining * self.unit_cost
    }
}

/// One layer-level effect of a mutation. Quantities are positive magnitudes;
/// `action` carries the direction. Deltas are transient — they are returned
/// to callers and logged to the audit trail, never stored as their own table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDelta {
    pub layer_id: Uuid,
    pub quantity_delta: Decimal,
    pub cost_delta: Decimal,
    pub action: AuditAction,
}
