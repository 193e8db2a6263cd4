use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Write-once audit trail: one row per layer mutation and per reconciliation
/// repair. Entries are never updated or deleted.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "layer_audit_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub position_id: Uuid,
    pub layer_id: Option<Uuid>,
    pub action: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub quantity_delta: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub cost_delta: Decimal,
    pub reference_type: String,
    pub reference_id: Option<Uuid>,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::inventory_position::Entity",
        from = "Column::PositionId",
        to = "super::inventory_position::Column::Id"
    )]
    InventoryPosition,
}

impl Related<super::inventory_position::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InventoryPosition.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// What happened to the layer set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    Create,
    Consume,
    /// Reconciler clamped an invalid remaining quantity into range.
    Clamp,
    /// Reconciler created a synthetic layer for uncovered stock.
    Synthesize,
    /// Reconciler recomputed the position's cached value fields.
    Revalue,
}
