use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, Set, TransactionError, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineThresholds;
use crate::costing::fifo::{plan_consumption, ConsumptionPlan};
use crate::costing::{LayerDelta, LayerView};
use crate::db::DbPool;
use crate::entities::{
    cost_layer::{self, ReferenceType},
    inventory_position,
    layer_audit_entry::AuditAction,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

use super::{
    bump_position_version, layer_views, load_position, record_audit,
    refresh_position_projection, CostLayerService,
};
use crate::services::cost_layers::NewLayerInput;

/// What to do when the FIFO walk runs out of layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallPolicy {
    /// Abort the whole withdrawal. The default; a shortfall is an integrity
    /// signal, not something to paper over silently.
    #[default]
    Abort,
    /// Cover the missing quantity with an explicit zero-cost layer, visible
    /// in the ledger and the audit trail.
    SynthesizeZeroCost,
}

/// One withdrawal request against a position's layer ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub position_id: Uuid,
    pub quantity: Decimal,
    pub reference_type: String,
    #[serde(default)]
    pub reference_id: Option<Uuid>,
    #[serde(default)]
    pub shortfall_policy: ShortfallPolicy,
}

/// Result of a consumption, simulated or applied. For the same committed
/// state and the same request, `simulate` and `consume` return the same
/// COGS, deltas, and post-walk layer quantities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionOutcome {
    pub position_id: Uuid,
    pub quantity: Decimal,
    pub cogs: Decimal,
    pub deltas: Vec<LayerDelta>,
    pub remaining_layers: Vec<LayerView>,
}

/// Drives FIFO withdrawals: plans against the layer ledger, applies the plan
/// under the position's optimistic version guard, and writes one audit row
/// per touched layer in the same transaction.
#[derive(Clone)]
pub struct ConsumptionService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    thresholds: EngineThresholds,
}

impl ConsumptionService {
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

    /// Plans a withdrawal against committed state without writing anything.
    #[instrument(skip(self))]
    pub async fn simulate(
        &self,
        request: ConsumeRequest,
    ) -> Result<ConsumptionOutcome, ServiceError> {
        let db = self.db_pool.as_ref();
        let position = load_position(db, request.position_id).await?;
        Self::validate_quantity(&position, request.quantity)?;

        let layers = CostLayerService::layers_ordered_by_age(db, request.position_id).await?;
        let mut views = layer_views(&layers);

        let plan = match plan_consumption(&views, request.quantity) {
            Ok(plan) => plan,
            Err(shortfall) => match request.shortfall_policy {
                ShortfallPolicy::Abort => {
                    return Err(ServiceError::InsufficientCostLayers {
                        position_id: request.position_id,
                        requested: shortfall.requested,
                        available: shortfall.available,
                    })
                }
                ShortfallPolicy::SynthesizeZeroCost => {
                    views.push(Self::virtual_shortfall_layer(&views, shortfall.missing));
                    plan_consumption(&views, request.quantity).map_err(|s| {
                        ServiceError::InternalError(format!(
                            "shortfall persisted after synthetic cover: missing {}",
                            s.missing
                        ))
                    })?
                }
            },
        };

        Ok(Self::outcome(request.position_id, request.quantity, plan))
    }

    /// Applies a withdrawal: drains layers oldest-first, audits each drain,
    /// and refreshes the position projection, all in one transaction guarded
    /// by the position's version.
    #[instrument(skip(self))]
    pub async fn consume(
        &self,
        request: ConsumeRequest,
    ) -> Result<ConsumptionOutcome, ServiceError> {
        let db = self.db_pool.as_ref();

        if request.quantity.is_zero() {
            // Nothing to drain; report the current ledger as-is.
            return self.simulate(request).await;
        }

        let currency_scale = self.thresholds.currency_scale;
        let txn_request = request.clone();

        let outcome = db
            .transaction::<_, ConsumptionOutcome, ServiceError>(move |txn| {
                Box::pin(async move {
                    let position = load_position(txn, txn_request.position_id).await?;
                    bump_position_version(txn, &position).await?;

                    let outcome =
                        Self::execute(txn, &position, &txn_request, currency_scale).await?;
                    refresh_position_projection(txn, &position).await?;
                    Ok(outcome)
                })
            })
            .await
            .map_err(|e| match e {
                TransactionError::Connection(db_err) => ServiceError::db_error(db_err),
                TransactionError::Transaction(service_err) => service_err,
            })?;

        info!(
            position_id = %outcome.position_id,
            quantity = %outcome.quantity,
            cogs = %outcome.cogs,
            layers_touched = outcome.deltas.len(),
            "layers consumed"
        );

        self.event_sender
            .send(Event::LayersConsumed {
                position_id: outcome.position_id,
                quantity: outcome.quantity,
                cogs: outcome.cogs,
                layers_touched: outcome.deltas.len(),
                reference_type: request.reference_type,
            })
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))?;

        Ok(outcome)
    }

    /// Plans and applies one withdrawal inside the caller's transaction.
    /// The caller owns the position's version guard and the projection
    /// refresh afterwards.
    pub(crate) async fn execute<C: ConnectionTrait>(
        conn: &C,
        position: &inventory_position::Model,
        request: &ConsumeRequest,
        currency_scale: u32,
    ) -> Result<ConsumptionOutcome, ServiceError> {
        Self::validate_quantity(position, request.quantity)?;

        let mut layers = CostLayerService::layers_ordered_by_age(conn, request.position_id).await?;

        let plan = match plan_consumption(&layer_views(&layers), request.quantity) {
            Ok(plan) => plan,
            Err(shortfall) => match request.shortfall_policy {
                ShortfallPolicy::Abort => {
                    return Err(ServiceError::InsufficientCostLayers {
                        position_id: request.position_id,
                        requested: shortfall.requested,
                        available: shortfall.available,
                    })
                }
                ShortfallPolicy::SynthesizeZeroCost => {
                    warn!(
                        position_id = %request.position_id,
                        missing = %shortfall.missing,
                        "covering shortfall with zero-cost layer"
                    );
                    let synthetic = CostLayerService::insert_layer(
                        conn,
                        &NewLayerInput {
                            position_id: request.position_id,
                            received_at: None,
                            quantity: shortfall.missing,
                            unit_cost: Decimal::ZERO,
                            components: Vec::new(),
                            reference_type: ReferenceType::Adjustment,
                            reference_id: request.reference_id,
                            expiry_date: None,
                            metadata: None,
                        },
                        currency_scale,
                    )
                    .await?;
                    layers.push(synthetic);
                    plan_consumption(&layer_views(&layers), request.quantity).map_err(|s| {
                        ServiceError::InternalError(format!(
                            "shortfall persisted after synthetic cover: missing {}",
                            s.missing
                        ))
                    })?
                }
            },
        };

        Self::apply_plan(conn, request, &layers, &plan).await?;
        Ok(Self::outcome(request.position_id, request.quantity, plan))
    }

    /// Persists a plan: one layer update and one audit row per delta.
    async fn apply_plan<C: ConnectionTrait>(
        conn: &C,
        request: &ConsumeRequest,
        layers: &[cost_layer::Model],
        plan: &ConsumptionPlan,
    ) -> Result<(), ServiceError> {
        let post_walk: HashMap<Uuid, Decimal> = plan
            .remaining_layers
            .iter()
            .map(|l| (l.id, l.quantity_remaining))
            .collect();

        for delta in &plan.deltas {
            let layer = layers
                .iter()
                .find(|l| l.id == delta.layer_id)
                .ok_or_else(|| {
                    ServiceError::InternalError(format!(
                        "planned layer {} not loaded",
                        delta.layer_id
                    ))
                })?;
            let new_remaining = post_walk.get(&delta.layer_id).copied().ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "planned layer {} missing from post-walk set",
                    delta.layer_id
                ))
            })?;

            let mut active: cost_layer::ActiveModel = layer.clone().into();
            active.quantity_remaining = Set(new_remaining);
            active.updated_at = Set(Utc::now());
            active.update(conn).await.map_err(ServiceError::db_error)?;

            record_audit(
                conn,
                request.position_id,
                Some(delta.layer_id),
                AuditAction::Consume,
                delta.quantity_delta,
                delta.cost_delta,
                &request.reference_type,
                request.reference_id,
                None,
            )
            .await?;
        }

        Ok(())
    }

    fn validate_quantity(
        position: &inventory_position::Model,
        quantity: Decimal,
    ) -> Result<(), ServiceError> {
        if quantity < Decimal::ZERO {
            return Err(ServiceError::InvalidInput(format!(
                "consumption quantity cannot be negative, got {}",
                quantity
            )));
        }
        if position.is_serialized() && quantity != quantity.trunc() {
            return Err(ServiceError::SerializedUnitViolation {
                position_id: position.id,
                reason: format!("fractional quantity {} on a serialized position", quantity),
            });
        }
        Ok(())
    }

    /// Placeholder layer that stands in for a would-be synthetic cover
    /// during simulation. Sorts after every real layer.
    fn virtual_shortfall_layer(views: &[LayerView], missing: Decimal) -> LayerView {
        let next_sequence = views.iter().map(|v| v.sequence).max().unwrap_or(0) + 1;
        LayerView {
            id: Uuid::nil(),
            received_at: Utc::now(),
            sequence: next_sequence,
            quantity_remaining: missing,
            unit_cost: Decimal::ZERO,
        }
    }

    fn outcome(position_id: Uuid, quantity: Decimal, plan: ConsumptionPlan) -> ConsumptionOutcome {
        ConsumptionOutcome {
            position_id,
            quantity,
            cogs: plan.cogs,
            deltas: plan.deltas,
            remaining_layers: plan.remaining_layers,
        }
    }
}
