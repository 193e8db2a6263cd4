use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One inventory position: product x location (x lot, x serial) within an
/// organization. The quantity and value columns are a cached projection of
/// the cost-layer ledger; layers stay the source of truth and the auditor
/// reconciles the projection.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_positions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub organization_id: Uuid,
    pub product_id: Uuid,
    pub location_id: Uuid,
    pub lot_number: Option<String>,
    pub serial_number: Option<String>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub quantity_on_hand: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub quantity_allocated: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub quantity_available: Decimal,
    /// Weighted average of remaining layer costs, refreshed on every layer
    /// mutation.
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub unit_cost: Decimal,
    /// Sum of remaining layer value, refreshed on every layer mutation.
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_value: Decimal,
    pub allow_negative: bool,
    /// Denormalized rollup key for valuation grouping. None when the product
    /// category was deleted; such positions still count toward grand totals.
    pub category: Option<String>,
    pub status: String,
    pub shipped_at: Option<DateTime<Utc>>,
    /// Optimistic lock enforcing single-writer-per-position.
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::cost_layer::Entity")]
    CostLayers,
    #[sea_orm(has_many = "super::layer_audit_entry::Entity")]
    LayerAuditEntries,
}

impl Related<super::cost_layer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CostLayers.def()
    }
}

impl Related<super::layer_audit_entry::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LayerAuditEntries.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Serialized-unit lifecycle for positions carrying a serial number.
/// Positions without a serial stay `Available` for their whole life.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum PositionStatus {
    Available,
    Allocated,
    Shipped,
    Retired,
}

impl Model {
    pub fn status(&self) -> Option<PositionStatus> {
        self.status.parse().ok()
    }

    pub fn is_serialized(&self) -> bool {
        self.serial_number.is_some()
    }
}
