pub mod consumption;
pub mod cost_layers;
pub mod integrity;
pub mod movements;
pub mod reconciliation;
pub mod valuation;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::costing::{valuation as valuation_math, LayerView};
use crate::db::DbPool;
use crate::entities::{cost_layer, inventory_position, layer_audit_entry};
use crate::errors::ServiceError;
use crate::events::EventSender;

pub use consumption::ConsumptionService;
pub use cost_layers::CostLayerService;
pub use integrity::FinanceIntegrityService;
pub use movements::MovementService;
pub use reconciliation::ReconciliationService;
pub use valuation::ValuationService;

/// All engine services wired over one pool and one event channel.
#[derive(Clone)]
pub struct AppServices {
    pub cost_layers: CostLayerService,
    pub consumption: ConsumptionService,
    pub movements: MovementService,
    pub valuation: ValuationService,
    pub integrity: FinanceIntegrityService,
    pub reconciliation: ReconciliationService,
}

impl AppServices {
    pub fn build(db: Arc<DbPool>, config: &AppConfig, event_sender: EventSender) -> Self {
        let thresholds = config.thresholds.clone();
        let cost_layers =
            CostLayerService::new(db.clone(), event_sender.clone(), thresholds.clone());
        let consumption =
            ConsumptionService::new(db.clone(), event_sender.clone(), thresholds.clone());
        let integrity =
            FinanceIntegrityService::new(db.clone(), event_sender.clone(), thresholds.clone());
        let movements = MovementService::new(
            db.clone(),
            event_sender.clone(),
            consumption.clone(),
            cost_layers.clone(),
            thresholds.clone(),
        );
        let valuation = ValuationService::new(db.clone());
        let reconciliation =
            ReconciliationService::new(db, event_sender, integrity.clone(), thresholds);

        Self {
            cost_layers,
            consumption,
            movements,
            valuation,
            integrity,
            reconciliation,
        }
    }
}

/// Projects ORM layer rows into the view the pure FIFO walk consumes.
pub(crate) fn layer_views(layers: &[cost_layer::Model]) -> Vec<LayerView> {
    layers
        .iter()
        .map(|l| LayerView {
            id: l.id,
            received_at: l.received_at,
            sequence: l.sequence,
            quantity_remaining: l.quantity_remaining,
            unit_cost: l.unit_cost,
        })
        .collect()
}

/// Optimistic single-writer guard: bumps the position's version only if it
/// still matches the copy the caller read. A lost race surfaces as
/// `ConcurrentModification` and rolls back the surrounding transaction,
/// so a consumption can never be half-applied.
pub(crate) async fn bump_position_version<C: ConnectionTrait>(
    conn: &C,
    position: &inventory_position::Model,
) -> Result<(), ServiceError> {
    let result = inventory_position::Entity::update_many()
        .col_expr(
            inventory_position::Column::Version,
            Expr::col(inventory_position::Column::Version).add(1),
        )
        .filter(inventory_position::Column::Id.eq(position.id))
        .filter(inventory_position::Column::Version.eq(position.version))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected != 1 {
        return Err(ServiceError::ConcurrentModification(position.id));
    }
    Ok(())
}

/// Recomputes the position's cached projection (on-hand, unit cost, total
/// value, available) from its layer ledger. Layers are the source of truth;
/// this is the only place the projection is written during normal flow.
pub(crate) async fn refresh_position_projection<C: ConnectionTrait>(
    conn: &C,
    position: &inventory_position::Model,
) -> Result<inventory_position::Model, ServiceError> {
    let layers = cost_layer::Entity::find()
        .filter(cost_layer::Column::PositionId.eq(position.id))
        .order_by_asc(cost_layer::Column::ReceivedAt)
        .order_by_asc(cost_layer::Column::Sequence)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let views = layer_views(&layers);
    let quantity_on_hand = valuation_math::remaining_quantity(&views);
    let total_value = valuation_math::remaining_value(&views);
    let unit_cost = valuation_math::weighted_average_unit_cost(&views).round_dp(4);

    let mut active: inventory_position::ActiveModel = position.clone().into();
    active.quantity_on_hand = Set(quantity_on_hand);
    active.quantity_available = Set(quantity_on_hand - position.quantity_allocated);
    active.unit_cost = Set(unit_cost);
    active.total_value = Set(total_value);
    active.updated_at = Set(Utc::now());

    active.update(conn).await.map_err(ServiceError::db_error)
}

/// Appends one write-once audit row. The trail gets a row for every layer
/// mutation and every reconciliation repair, in the same transaction as the
/// mutation itself.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn record_audit<C: ConnectionTrait>(
    conn: &C,
    position_id: Uuid,
    layer_id: Option<Uuid>,
    action: layer_audit_entry::AuditAction,
    quantity_delta: Decimal,
    cost_delta: Decimal,
    reference_type: &str,
    reference_id: Option<Uuid>,
    note: Option<String>,
) -> Result<(), ServiceError> {
    let entry = layer_audit_entry::ActiveModel {
        id: Set(Uuid::new_v4()),
        position_id: Set(position_id),
        layer_id: Set(layer_id),
        action: Set(action.to_string()),
        quantity_delta: Set(quantity_delta),
        cost_delta: Set(cost_delta),
        reference_type: Set(reference_type.to_string()),
        reference_id: Set(reference_id),
        note: Set(note),
        recorded_at: Set(Utc::now()),
    };

    entry.insert(conn).await.map_err(ServiceError::db_error)?;
    Ok(())
}

/// Loads one position or fails with the id the caller asked for.
pub(crate) async fn load_position<C: ConnectionTrait>(
    conn: &C,
    position_id: Uuid,
) -> Result<inventory_position::Model, ServiceError> {
    inventory_position::Entity::find_by_id(position_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("inventory position {position_id}")))
}
