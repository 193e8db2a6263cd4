use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted point-in-time copy of a `FinanceIntegritySummary`, kept for
/// trend tracking across audit runs.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "integrity_snapshots")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub as_of: DateTime<Utc>,
    pub status: String,
    pub scanned_positions: i64,
    pub stock_without_active_layers: i64,
    pub inventory_value_mismatch: i64,
    pub negative_or_overconsumed_layers: i64,
    pub duplicate_serialized_allocations: i64,
    pub shipment_link_status_mismatch: i64,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_absolute_drift: Decimal,
    /// Top-N worst-drifted positions, serialized as the summary reports them.
    #[sea_orm(column_type = "JsonBinary")]
    pub worst_positions: Json,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
