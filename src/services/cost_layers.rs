use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionError, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::EngineThresholds;
use crate::db::DbPool;
use crate::entities::{
    cost_component::{self, ComponentType},
    cost_layer::{self, LayerMetadata, ReferenceType},
    layer_audit_entry::AuditAction,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

use super::{bump_position_version, load_position, record_audit, refresh_position_projection};

/// One cost component of an incoming layer. `amount_total` is the component's
/// total for the whole received quantity, in the ledger currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInput {
    pub component_type: ComponentType,
    pub amount_total: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub exchange_rate: Option<Decimal>,
}

/// Request to append one receipt layer to a position's ledger.
///
/// If `components` is empty, a single base component covering the full
/// `quantity * unit_cost` is recorded. If components are given, their totals
/// must add up to `quantity * unit_cost` within one minor unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLayerInput {
    pub position_id: Uuid,
    #[serde(default)]
    pub received_at: Option<chrono::DateTime<Utc>>,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    #[serde(default)]
    pub components: Vec<ComponentInput>,
    pub reference_type: ReferenceType,
    #[serde(default)]
    pub reference_id: Option<Uuid>,
    #[serde(default)]
    pub expiry_date: Option<NaiveDate>,
    #[serde(default)]
    pub metadata: Option<LayerMetadata>,
}

/// Maintains the append-only layer ledger: layer creation with component
/// breakdown, ordered reads for the FIFO walk, and guarded remaining-quantity
/// mutations. Consumption and movements build on these primitives inside
/// their own transactions.
#[derive(Clone)]
pub struct CostLayerService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    thresholds: EngineThresholds,
}

impl CostLayerService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        thresholds: EngineThresholds,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            thresholds,
        }
    }

    /// Appends one layer (and its components) to the position's ledger and
    /// refreshes the position's cached projection.
    #[instrument(skip(self))]
    pub async fn create_layer(
        &self,
        input: NewLayerInput,
    ) -> Result<cost_layer::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        let currency_scale = self.thresholds.currency_scale;
        let txn_input = input.clone();

        let layer = db
            .transaction::<_, cost_layer::Model, ServiceError>(move |txn| {
                Box::pin(async move {
                    let position = load_position(txn, txn_input.position_id).await?;
                    bump_position_version(txn, &position).await?;

                    let layer = Self::insert_layer(txn, &txn_input, currency_scale).await?;
                    refresh_position_projection(txn, &position).await?;
                    Ok(layer)
                })
            })
            .await
            .map_err(|e| match e {
                TransactionError::Connection(db_err) => ServiceError::db_error(db_err),
                TransactionError::Transaction(service_err) => service_err,
            })?;

        info!(
            position_id = %layer.position_id,
            layer_id = %layer.id,
            quantity = %layer.quantity_received,
            unit_cost = %layer.unit_cost,
            "cost layer created"
        );

        self.event_sender
            .send(Event::LayerCreated {
                position_id: layer.position_id,
                layer_id: layer.id,
                quantity: layer.quantity_received,
                unit_cost: layer.unit_cost,
                reference_type: layer.reference_type.clone(),
            })
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))?;

        Ok(layer)
    }

    /// All layers of a position in FIFO order, drained layers included.
    pub async fn layers_for_position(
        &self,
        position_id: Uuid,
    ) -> Result<Vec<cost_layer::Model>, ServiceError> {
        Self::layers_ordered_by_age(self.db_pool.as_ref(), position_id).await
    }

    /// Component breakdown of one layer.
    pub async fn components_for_layer(
        &self,
        layer_id: Uuid,
    ) -> Result<Vec<cost_component::Model>, ServiceError> {
        cost_component::Entity::find()
            .filter(cost_component::Column::LayerId.eq(layer_id))
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    /// Adjusts one layer's remaining quantity by `delta` (signed), keeping
    /// the result inside `[0, quantity_received]`, and refreshes the
    /// position projection.
    pub async fn mutate_remaining(
        &self,
        layer_id: Uuid,
        delta: Decimal,
        note: Option<String>,
    ) -> Result<cost_layer::Model, ServiceError> {
        let db = self.db_pool.as_ref();

        db.transaction::<_, cost_layer::Model, ServiceError>(move |txn| {
            Box::pin(async move {
                let layer = cost_layer::Entity::find_by_id(layer_id)
                    .one(txn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .ok_or_else(|| ServiceError::NotFound(format!("cost layer {layer_id}")))?;

                let position = load_position(txn, layer.position_id).await?;
                bump_position_version(txn, &position).await?;

                let updated = Self::apply_remaining_delta(txn, &layer, delta, note).await?;
                refresh_position_projection(txn, &position).await?;
                Ok(updated)
            })
        })
        .await
        .map_err(|e| match e {
            TransactionError::Connection(db_err) => ServiceError::db_error(db_err),
            TransactionError::Transaction(service_err) => service_err,
        })
    }

    /// Transaction-scoped layer read in FIFO order: oldest `received_at`
    /// first, `sequence` breaking timestamp ties.
    pub(crate) async fn layers_ordered_by_age<C: ConnectionTrait>(
        conn: &C,
        position_id: Uuid,
    ) -> Result<Vec<cost_layer::Model>, ServiceError> {
        cost_layer::Entity::find()
            .filter(cost_layer::Column::PositionId.eq(position_id))
            .order_by_asc(cost_layer::Column::ReceivedAt)
            .order_by_asc(cost_layer::Column::Sequence)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Inserts one layer plus its components inside the caller's transaction.
    /// The caller is responsible for the version guard and the projection
    /// refresh on the owning position.
    pub(crate) async fn insert_layer<C: ConnectionTrait>(
        conn: &C,
        input: &NewLayerInput,
        currency_scale: u32,
    ) -> Result<cost_layer::Model, ServiceError> {
        if input.quantity <= Decimal::ZERO {
            return Err(ServiceError::InvalidInput(format!(
                "layer quantity must be positive, got {}",
                input.quantity
            )));
        }
        if input.unit_cost < Decimal::ZERO {
            return Err(ServiceError::InvalidInput(format!(
                "layer unit cost cannot be negative, got {}",
                input.unit_cost
            )));
        }

        let layer_value = input.quantity * input.unit_cost;
        let components = if input.components.is_empty() {
            vec![ComponentInput {
                component_type: ComponentType::Base,
                amount_total: layer_value,
                currency: None,
                exchange_rate: None,
            }]
        } else {
            let component_sum: Decimal =
                input.components.iter().map(|c| c.amount_total).sum();
            let minor_unit = Decimal::new(1, currency_scale);
            if (component_sum - layer_value).abs() > minor_unit {
                return Err(ServiceError::ValidationError(format!(
                    "component totals {} disagree with layer value {} by more than one minor unit",
                    component_sum, layer_value
                )));
            }
            input.components.clone()
        };

        let received_at = input.received_at.unwrap_or_else(Utc::now);
        let sequence = Self::next_sequence(conn, input.position_id).await?;
        let now = Utc::now();
        let layer_id = Uuid::new_v4();

        let metadata_json = match &input.metadata {
            Some(meta) if !meta.is_empty() => Some(
                serde_json::to_value(meta)
                    .map_err(|e| ServiceError::InvalidInput(format!("layer metadata: {}", e)))?,
            ),
            _ => None,
        };

        let layer = cost_layer::ActiveModel {
            id: Set(layer_id),
            position_id: Set(input.position_id),
            received_at: Set(received_at),
            sequence: Set(sequence),
            quantity_received: Set(input.quantity),
            quantity_remaining: Set(input.quantity),
            unit_cost: Set(input.unit_cost),
            reference_type: Set(input.reference_type.to_string()),
            reference_id: Set(input.reference_id),
            expiry_date: Set(input.expiry_date),
            metadata: Set(metadata_json),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let layer = layer.insert(conn).await.map_err(ServiceError::db_error)?;

        for component in &components {
            let amount_per_unit = (component.amount_total / input.quantity).round_dp(4);
            let row = cost_component::ActiveModel {
                id: Set(Uuid::new_v4()),
                layer_id: Set(layer_id),
                component_type: Set(component.component_type.to_string()),
                quantity_basis: Set(input.quantity),
                amount_total: Set(component.amount_total),
                amount_per_unit: Set(amount_per_unit),
                currency: Set(component.currency.clone().unwrap_or_else(|| "USD".into())),
                exchange_rate: Set(component.exchange_rate.unwrap_or(Decimal::ONE)),
                created_at: Set(now),
            };
            row.insert(conn).await.map_err(ServiceError::db_error)?;
        }

        record_audit(
            conn,
            input.position_id,
            Some(layer_id),
            AuditAction::Create,
            input.quantity,
            layer_value,
            &input.reference_type.to_string(),
            input.reference_id,
            None,
        )
        .await?;

        Ok(layer)
    }

    /// Applies a signed remaining-quantity delta to one layer row,
    /// rejecting results outside `[0, quantity_received]`.
    pub(crate) async fn apply_remaining_delta<C: ConnectionTrait>(
        conn: &C,
        layer: &cost_layer::Model,
        delta: Decimal,
        note: Option<String>,
    ) -> Result<cost_layer::Model, ServiceError> {
        let new_remaining = layer.quantity_remaining + delta;
        if new_remaining < Decimal::ZERO || new_remaining > layer.quantity_received {
            return Err(ServiceError::InvalidLayerState {
                layer_id: layer.id,
                reason: format!(
                    "remaining {} + delta {} leaves [0, {}]",
                    layer.quantity_remaining, delta, layer.quantity_received
                ),
            });
        }

        let mut active: cost_layer::ActiveModel = layer.clone().into();
        active.quantity_remaining = Set(new_remaining);
        active.updated_at = Set(Utc::now());
        let updated = active.update(conn).await.map_err(ServiceError::db_error)?;

        let action = if delta < Decimal::ZERO {
            AuditAction::Consume
        } else {
            AuditAction::Create
        };
        record_audit(
            conn,
            layer.position_id,
            Some(layer.id),
            action,
            delta.abs(),
            (delta * layer.unit_cost).abs(),
            &layer.reference_type,
            layer.reference_id,
            note,
        )
        .await?;

        Ok(updated)
    }

    async fn next_sequence<C: ConnectionTrait>(
        conn: &C,
        position_id: Uuid,
    ) -> Result<i64, ServiceError> {
        let newest = cost_layer::Entity::find()
            .filter(cost_layer::Column::PositionId.eq(position_id))
            .order_by_desc(cost_layer::Column::Sequence)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(newest.map(|l| l.sequence + 1).unwrap_or(1))
    }
}
