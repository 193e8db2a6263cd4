use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One receipt batch at a fixed unit cost, drained oldest-first.
///
/// Layers are append/shrink-only: `quantity_received` and `unit_cost` are
/// immutable once created, `quantity_remaining` only ever decreases, and
/// fully-consumed layers persist at zero remaining for the audit trail.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cost_layers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub position_id: Uuid,
    pub received_at: DateTime<Utc>,
    /// Monotonic per-position creation counter; secondary FIFO sort key for
    /// layers sharing the same `received_at`.
    pub sequence: i64,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub quantity_received: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub quantity_remaining: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub unit_cost: Decimal,
    pub reference_type: String,
    pub reference_id: Option<Uuid>,
    pub expiry_date: Option<NaiveDate>,
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::inventory_position::Entity",
        from = "Column::PositionId",
        to = "super::inventory_position::Column::Id"
    )]
    InventoryPosition,
    #[sea_orm(has_many = "super::cost_component::Entity")]
    CostComponents,
}

impl Related<super::inventory_position::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InventoryPosition.def()
    }
}

impl Related<super::cost_component::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CostComponents.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Origin of a layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum ReferenceType {
    PurchaseOrder,
    Adjustment,
    Transfer,
    Rma,
    /// Synthetic layer created by the reconciler, never by normal intake.
    Reconciliation,
}

/// Known metadata fields plus a forward-compatible extension map.
///
/// Callers attach supplier context at receipt; unknown keys survive a
/// round-trip untouched instead of being silently dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplier_lot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplier_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_reason: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl LayerMetadata {
    pub fn is_empty(&self) -> bool {
        self.supplier_lot.is_none()
            && self.supplier_id.is_none()
            && self.quarantine_reason.is_none()
            && self.extra.is_empty()
    }
}

impl Model {
    pub fn reference_type(&self) -> Option<ReferenceType> {
        self.reference_type.parse().ok()
    }

    pub fn metadata(&self) -> Option<LayerMetadata> {
        self.metadata
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Remaining monetary value held by this layer.
    pub fn remaining_value(&self) -> Decimal {
        self.quantity_remaining * self.unit_cost
    }
}
