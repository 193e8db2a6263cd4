use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{cost_layer, inventory_position};
use crate::errors::ServiceError;

use super::CostLayerService;

/// Valuation basis for a report. FIFO recomputes each position's value from
/// its layer ledger; weighted average prices on-hand quantity at the cached
/// average unit cost.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ValuationMethod {
    #[default]
    Fifo,
    WeightedAverage,
}

/// Optional scope filters for a valuation report. Unset fields match all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValuationFilter {
    #[serde(default)]
    pub organization_id: Option<Uuid>,
    #[serde(default)]
    pub product_id: Option<Uuid>,
    #[serde(default)]
    pub location_id: Option<Uuid>,
    #[serde(default)]
    pub category: Option<String>,
}

/// One rollup bucket of a valuation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTotal {
    pub key: String,
    pub total_value: Decimal,
    pub total_units: Decimal,
    pub positions: u64,
}

/// Point-in-time valuation over the scoped positions, with by-product,
/// by-location, and by-category rollups. Positions without a category are
/// counted in the grand total but excluded from the category rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationReport {
    pub as_of: DateTime<Utc>,
    pub method: ValuationMethod,
    pub total_value: Decimal,
    pub total_units: Decimal,
    pub positions: u64,
    pub distinct_products: u64,
    pub by_product: Vec<GroupTotal>,
    pub by_location: Vec<GroupTotal>,
    pub by_category: Vec<GroupTotal>,
}

/// Read-side valuation: pure rollups over the committed ledger, never a
/// write.
#[derive(Clone)]
pub struct ValuationService {
    db_pool: Arc<DbPool>,
}

impl ValuationService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Current FIFO value of one position, recomputed from its layers.
    pub async fn value_position(&self, position_id: Uuid) -> Result<Decimal, ServiceError> {
        let db = self.db_pool.as_ref();
        inventory_position::Entity::find_by_id(position_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("inventory position {position_id}")))?;

        let layers = CostLayerService::layers_ordered_by_age(db, position_id).await?;
        Ok(layers.iter().map(|l| l.remaining_value()).sum())
    }

    /// Builds a valuation report over every position matching the filter.
    #[instrument(skip(self))]
    pub async fn report(
        &self,
        filter: ValuationFilter,
        method: ValuationMethod,
    ) -> Result<ValuationReport, ServiceError> {
        let db = self.db_pool.as_ref();

        let mut query = inventory_position::Entity::find();
        if let Some(org) = filter.organization_id {
            query = query.filter(inventory_position::Column::OrganizationId.eq(org));
        }
        if let Some(product) = filter.product_id {
            query = query.filter(inventory_position::Column::ProductId.eq(product));
        }
        if let Some(location) = filter.location_id {
            query = query.filter(inventory_position::Column::LocationId.eq(location));
        }
        if let Some(category) = &filter.category {
            query = query.filter(inventory_position::Column::Category.eq(category.clone()));
        }

        let positions = query.all(db).await.map_err(ServiceError::db_error)?;

        let values = match method {
            ValuationMethod::Fifo => Self::fifo_values(db, &positions).await?,
            ValuationMethod::WeightedAverage => positions
                .iter()
                .map(|p| (p.id, p.unit_cost * p.quantity_on_hand))
                .collect(),
        };

        let mut total_value = Decimal::ZERO;
        let mut total_units = Decimal::ZERO;
        let mut products: HashSet<Uuid> = HashSet::new();
        let mut by_product: BTreeMap<String, GroupTotal> = BTreeMap::new();
        let mut by_location: BTreeMap<String, GroupTotal> = BTreeMap::new();
        let mut by_category: BTreeMap<String, GroupTotal> = BTreeMap::new();

        for position in &positions {
            let value = values.get(&position.id).copied().unwrap_or(Decimal::ZERO);
            total_value += value;
            total_units += position.quantity_on_hand;
            products.insert(position.product_id);

            accumulate(
                &mut by_product,
                position.product_id.to_string(),
                value,
                position.quantity_on_hand,
            );
            accumulate(
                &mut by_location,
                position.location_id.to_string(),
                value,
                position.quantity_on_hand,
            );
            if let Some(category) = &position.category {
                accumulate(
                    &mut by_category,
                    category.clone(),
                    value,
                    position.quantity_on_hand,
                );
            }
        }

        Ok(ValuationReport {
            as_of: Utc::now(),
            method,
            total_value,
            total_units,
            positions: positions.len() as u64,
            distinct_products: products.len() as u64,
            by_product: by_product.into_values().collect(),
            by_location: by_location.into_values().collect(),
            by_category: by_category.into_values().collect(),
        })
    }

    /// Per-position FIFO values, recomputed from the layer ledger in one
    /// query over the scoped positions.
    async fn fifo_values(
        db: &DbPool,
        positions: &[inventory_position::Model],
    ) -> Result<HashMap<Uuid, Decimal>, ServiceError> {
        let ids: Vec<Uuid> = positions.iter().map(|p| p.id).collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let layers = cost_layer::Entity::find()
            .filter(cost_layer::Column::PositionId.is_in(ids))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut values: HashMap<Uuid, Decimal> = HashMap::new();
        for layer in layers {
            *values.entry(layer.position_id).or_insert(Decimal::ZERO) +=
                layer.remaining_value();
        }
        Ok(values)
    }
}

fn accumulate(
    buckets: &mut BTreeMap<String, GroupTotal>,
    key: String,
    value: Decimal,
    units: Decimal,
) {
    let entry = buckets.entry(key.clone()).or_insert_with(|| GroupTotal {
        key,
        total_value: Decimal::ZERO,
        total_units: Decimal::ZERO,
        positions: 0,
    });
    entry.total_value += value;
    entry.total_units += units;
    entry.positions += 1;
}
