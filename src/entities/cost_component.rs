use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One cost contribution baked into a layer's unit cost: the base purchase
/// price or an allocated landed cost (freight, duty, insurance).
/// Components are created atomically with their parent layer and the sum of
/// `amount_per_unit` equals the layer's `unit_cost` within one minor unit.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cost_components")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub layer_id: Uuid,
    pub component_type: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub quantity_basis: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub amount_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub amount_per_unit: Decimal,
    pub currency: String,
    #[sea_orm(column_type = "Decimal(Some((19, 8)))")]
    pub exchange_rate: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::cost_layer::Entity",
        from = "Column::LayerId",
        to = "super::cost_layer::Column::Id"
    )]
    CostLayer,
}

impl Related<super::cost_layer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CostLayer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum ComponentType {
    Base,
    Freight,
    Duty,
    Insurance,
    Handling,
    Other,
}

impl Model {
    pub fn component_type(&self) -> Option<ComponentType> {
        self.component_type.parse().ok()
    }
}
