use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set, SqlErr,
    TransactionError, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::config::EngineThresholds;
use crate::costing::landed_cost::{allocate, AllocationItem, AllocationMethod};
use crate::db::DbPool;
use crate::entities::{
    cost_component::ComponentType,
    cost_layer::{self, LayerMetadata, ReferenceType},
    inventory_position::{self, PositionStatus},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

use super::{
    bump_position_version, load_position, refresh_position_projection, ConsumptionService,
    CostLayerService,
};
use crate::services::consumption::{ConsumeRequest, ConsumptionOutcome, ShortfallPolicy};
use crate::services::cost_layers::{ComponentInput, NewLayerInput};

/// Natural key of an inventory position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionKey {
    pub organization_id: Uuid,
    pub product_id: Uuid,
    pub location_id: Uuid,
    #[serde(default)]
    pub lot_number: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
}

/// One line of an incoming shipment. `unit_cost` is the base (supplier
/// invoice) cost; additional receipt costs are layered on top by the
/// landed-cost allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub key: PositionKey,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    #[serde(default)]
    pub weight: Decimal,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub expiry_date: Option<NaiveDate>,
    #[serde(default)]
    pub metadata: Option<LayerMetadata>,
}

/// One shipment-level cost (freight, duty, ...) spread across the lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditionalCost {
    pub component_type: ComponentType,
    pub amount: Decimal,
    pub method: AllocationMethod,
}

/// An incoming shipment: line items plus shipment-level costs to allocate
/// across them before any layer is created.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReceiptCommand {
    #[validate(length(min = 1, message = "a receipt needs at least one line"))]
    pub lines: Vec<ReceiptLine>,
    #[serde(default)]
    pub additional_costs: Vec<AdditionalCost>,
    #[serde(default)]
    pub reference_id: Option<Uuid>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

/// One created layer of a receipt, with the landed unit cost that ended up
/// on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptResult {
    pub position_id: Uuid,
    pub layer_id: Uuid,
    pub quantity: Decimal,
    pub landed_unit_cost: Decimal,
}

/// Outcome of a transfer: what left the source and what was recreated at
/// the target, age preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub source_position_id: Uuid,
    pub target_position_id: Uuid,
    pub quantity: Decimal,
    pub value_moved: Decimal,
    pub layers_recreated: usize,
}

/// A stock movement as a single typed command, useful for callers that
/// carry movements through queues or request bodies rather than calling
/// the individual service methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "movement", rename_all = "snake_case")]
pub enum StockMovement {
    Receive(ReceiptCommand),
    Allocate {
        position_id: Uuid,
        quantity: Decimal,
    },
    Deallocate {
        position_id: Uuid,
        quantity: Decimal,
    },
    Pick {
        position_id: Uuid,
        quantity: Decimal,
        #[serde(default)]
        reference_id: Option<Uuid>,
    },
    Ship {
        position_id: Uuid,
        quantity: Decimal,
        #[serde(default)]
        reference_id: Option<Uuid>,
    },
    Adjust {
        position_id: Uuid,
        quantity_delta: Decimal,
        #[serde(default)]
        unit_cost: Option<Decimal>,
        #[serde(default)]
        note: Option<String>,
    },
    Return {
        position_id: Uuid,
        quantity: Decimal,
        unit_cost: Decimal,
        #[serde(default)]
        rma_id: Option<Uuid>,
    },
    Transfer {
        source_position_id: Uuid,
        target_key: PositionKey,
        quantity: Decimal,
    },
}

/// What a dispatched [`StockMovement`] produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementOutcome {
    Received(Vec<ReceiptResult>),
    HoldChanged { position_id: Uuid, available: Decimal },
    Consumed(ConsumptionOutcome),
    Adjusted { position_id: Uuid },
    Returned { position_id: Uuid, layer_id: Uuid },
    Transferred(TransferResult),
}

/// Stock movement flows over positions and their layer ledgers: receipts
/// with landed-cost allocation, allocation holds, picks and shipments,
/// adjustments, returns, and transfers.
#[derive(Clone)]
pub struct MovementService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    consumption: ConsumptionService,
    cost_layers: CostLayerService,
    thresholds: EngineThresholds,
}

impl MovementService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        consumption: ConsumptionService,
        cost_layers: CostLayerService,
        thresholds: EngineThresholds,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            consumption,
            cost_layers,
            thresholds,
        }
    }

    /// Dispatches a [`StockMovement`] command to the matching operation.
    #[instrument(skip(self))]
    pub async fn apply(&self, movement: StockMovement) -> Result<MovementOutcome, ServiceError> {
        match movement {
            StockMovement::Receive(command) => {
                self.receive_shipment(command).await.map(MovementOutcome::Received)
            }
            StockMovement::Allocate {
                position_id,
                quantity,
            } => {
                let position = self.allocate(position_id, quantity).await?;
                Ok(MovementOutcome::HoldChanged {
                    position_id: position.id,
                    available: position.quantity_available,
                })
            }
            StockMovement::Deallocate {
                position_id,
                quantity,
            } => {
                let position = self.deallocate(position_id, quantity).await?;
                Ok(MovementOutcome::HoldChanged {
                    position_id: position.id,
                    available: position.quantity_available,
                })
            }
            StockMovement::Pick {
                position_id,
                quantity,
                reference_id,
            } => self
                .pick(position_id, quantity, reference_id)
                .await
                .map(MovementOutcome::Consumed),
            StockMovement::Ship {
                position_id,
                quantity,
                reference_id,
            } => self
                .ship(position_id, quantity, reference_id)
                .await
                .map(MovementOutcome::Consumed),
            StockMovement::Adjust {
                position_id,
                quantity_delta,
                unit_cost,
                note,
            } => {
                self.adjust(position_id, quantity_delta, unit_cost, note)
                    .await?;
                Ok(MovementOutcome::Adjusted { position_id })
            }
            StockMovement::Return {
                position_id,
                quantity,
                unit_cost,
                rma_id,
            } => {
                let layer = self
                    .return_to_stock(position_id, quantity, unit_cost, rma_id)
                    .await?;
                Ok(MovementOutcome::Returned {
                    position_id,
                    layer_id: layer.id,
                })
            }
            StockMovement::Transfer {
                source_position_id,
                target_key,
                quantity,
            } => self
                .transfer(source_position_id, target_key, quantity)
                .await
                .map(MovementOutcome::Transferred),
        }
    }

    /// Receives a shipment atomically: allocates every shipment-level cost
    /// across the lines, then creates one layer per line with its full
    /// component breakdown. Either every line lands or none does.
    #[instrument(skip(self))]
    pub async fn receive_shipment(
        &self,
        command: ReceiptCommand,
    ) -> Result<Vec<ReceiptResult>, ServiceError> {
        command.validate()?;
        for line in &command.lines {
            if line.quantity <= Decimal::ZERO {
                return Err(ServiceError::InvalidInput(format!(
                    "receipt line quantity must be positive, got {}",
                    line.quantity
                )));
            }
            if line.unit_cost < Decimal::ZERO {
                return Err(ServiceError::InvalidInput(format!(
                    "receipt line unit cost cannot be negative, got {}",
                    line.unit_cost
                )));
            }
            if line.key.serial_number.is_some() && line.quantity != Decimal::ONE {
                return Err(ServiceError::SerializedUnitViolation {
                    position_id: Uuid::nil(),
                    reason: format!(
                        "serialized line must receive exactly one unit, got {}",
                        line.quantity
                    ),
                });
            }
        }

        // Allocate each shipment-level cost across lines before touching
        // the database. Shares per line, indexed by a per-line handle.
        let line_ids: Vec<Uuid> = command.lines.iter().map(|_| Uuid::new_v4()).collect();
        let items: Vec<AllocationItem> = command
            .lines
            .iter()
            .zip(&line_ids)
            .map(|(line, id)| AllocationItem {
                id: *id,
                value: line.quantity * line.unit_cost,
                weight: line.weight,
                quantity: line.quantity,
            })
            .collect();

        let scale = self.thresholds.currency_scale;
        let mut extra_components: Vec<Vec<ComponentInput>> =
            vec![Vec::new(); command.lines.len()];
        for cost in &command.additional_costs {
            let shares = allocate(cost.amount, cost.method, &items, scale)?;
            for share in shares {
                let idx = line_ids
                    .iter()
                    .position(|id| *id == share.item_id)
                    .ok_or_else(|| {
                        ServiceError::InternalError("allocation returned unknown item".into())
                    })?;
                if !share.amount.is_zero() {
                    extra_components[idx].push(ComponentInput {
                        component_type: cost.component_type,
                        amount_total: share.amount,
                        currency: None,
                        exchange_rate: None,
                    });
                }
            }
        }

        let db = self.db_pool.as_ref();
        let txn_command = command.clone();
        let txn_extras = extra_components;

        let results = db
            .transaction::<_, Vec<ReceiptResult>, ServiceError>(move |txn| {
                Box::pin(async move {
                    let mut results = Vec::with_capacity(txn_command.lines.len());

                    for (line, extras) in txn_command.lines.iter().zip(txn_extras) {
                        let (position, created) =
                            find_or_create_position(txn, &line.key, line.category.as_deref())
                                .await?;

                        if line.key.serial_number.is_some() {
                            check_serial_receivable(txn, &position, created).await?;
                        }
                        if !created {
                            bump_position_version(txn, &position).await?;
                        }

                        let base = line.quantity * line.unit_cost;
                        let extra_total: Decimal =
                            extras.iter().map(|c| c.amount_total).sum();
                        let landed_unit_cost =
                            ((base + extra_total) / line.quantity).round_dp(4);
                        // The base component absorbs the sub-minor-unit
                        // remainder of rounding the landed unit cost, so the
                        // components always sum to quantity * unit_cost.
                        let base_component = line.quantity * landed_unit_cost - extra_total;

                        let mut components = vec![ComponentInput {
                            component_type: ComponentType::Base,
                            amount_total: base_component,
                            currency: None,
                            exchange_rate: None,
                        }];
                        components.extend(extras);

                        let layer = CostLayerService::insert_layer(
                            txn,
                            &NewLayerInput {
                                position_id: position.id,
                                received_at: txn_command.received_at,
                                quantity: line.quantity,
                                unit_cost: landed_unit_cost,
                                components,
                                reference_type: ReferenceType::PurchaseOrder,
                                reference_id: txn_command.reference_id,
                                expiry_date: line.expiry_date,
                                metadata: line.metadata.clone(),
                            },
                            scale,
                        )
                        .await?;

                        refresh_position_projection(txn, &position).await?;

                        results.push(ReceiptResult {
                            position_id: position.id,
                            layer_id: layer.id,
                            quantity: line.quantity,
                            landed_unit_cost,
                        });
                    }

                    Ok(results)
                })
            })
            .await
            .map_err(map_txn_error)?;

        for result in &results {
            self.event_sender
                .send(Event::LayerCreated {
                    position_id: result.position_id,
                    layer_id: result.layer_id,
                    quantity: result.quantity,
                    unit_cost: result.landed_unit_cost,
                    reference_type: ReferenceType::PurchaseOrder.to_string(),
                })
                .await
                .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))?;
        }

        info!(lines = results.len(), "shipment received");
        Ok(results)
    }

    /// Places an allocation hold on available stock.
    #[instrument(skip(self))]
    pub async fn allocate(
        &self,
        position_id: Uuid,
        quantity: Decimal,
    ) -> Result<inventory_position::Model, ServiceError> {
        let db = self.db_pool.as_ref();

        let position = db
            .transaction::<_, inventory_position::Model, ServiceError>(move |txn| {
                Box::pin(async move {
                    let position = load_position(txn, position_id).await?;
                    if quantity <= Decimal::ZERO {
                        return Err(ServiceError::InvalidInput(format!(
                            "allocation quantity must be positive, got {}",
                            quantity
                        )));
                    }
                    if position.is_serialized() {
                        if quantity != Decimal::ONE {
                            return Err(ServiceError::SerializedUnitViolation {
                                position_id,
                                reason: format!(
                                    "serialized allocation must be one unit, got {}",
                                    quantity
                                ),
                            });
                        }
                        if position.status() != Some(PositionStatus::Available) {
                            return Err(ServiceError::InvalidSerialState {
                                position_id,
                                reason: format!(
                                    "serial unit is {} and cannot be allocated",
                                    position.status
                                ),
                            });
                        }
                    }
                    if !position.allow_negative && position.quantity_available < quantity {
                        return Err(ServiceError::InvalidOperation(format!(
                            "cannot allocate {}: only {} available",
                            quantity, position.quantity_available
                        )));
                    }
                    bump_position_version(txn, &position).await?;

                    let mut active: inventory_position::ActiveModel = position.clone().into();
                    active.quantity_allocated = Set(position.quantity_allocated + quantity);
                    active.quantity_available = Set(position.quantity_available - quantity);
                    if position.is_serialized() {
                        active.status = Set(PositionStatus::Allocated.to_string());
                    }
                    active.updated_at = Set(Utc::now());
                    active.update(txn).await.map_err(ServiceError::db_error)
                })
            })
            .await
            .map_err(map_txn_error)?;

        self.event_sender
            .send(Event::StockAllocated {
                position_id,
                quantity,
            })
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))?;

        Ok(position)
    }

    /// Releases an allocation hold back to available.
    #[instrument(skip(self))]
    pub async fn deallocate(
        &self,
        position_id: Uuid,
        quantity: Decimal,
    ) -> Result<inventory_position::Model, ServiceError> {
        let db = self.db_pool.as_ref();

        let position = db
            .transaction::<_, inventory_position::Model, ServiceError>(move |txn| {
                Box::pin(async move {
                    let position = load_position(txn, position_id).await?;
                    if quantity <= Decimal::ZERO {
                        return Err(ServiceError::InvalidInput(format!(
                            "deallocation quantity must be positive, got {}",
                            quantity
                        )));
                    }
                    if position.quantity_allocated < quantity {
                        return Err(ServiceError::InvalidOperation(format!(
                            "cannot deallocate {}: only {} allocated",
                            quantity, position.quantity_allocated
                        )));
                    }
                    bump_position_version(txn, &position).await?;

                    let mut active: inventory_position::ActiveModel = position.clone().into();
                    active.quantity_allocated = Set(position.quantity_allocated - quantity);
                    active.quantity_available = Set(position.quantity_available + quantity);
                    if position.is_serialized()
                        && position.status() == Some(PositionStatus::Allocated)
                    {
                        active.status = Set(PositionStatus::Available.to_string());
                    }
                    active.updated_at = Set(Utc::now());
                    active.update(txn).await.map_err(ServiceError::db_error)
                })
            })
            .await
            .map_err(map_txn_error)?;

        self.event_sender
            .send(Event::StockDeallocated {
                position_id,
                quantity,
            })
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))?;

        Ok(position)
    }

    /// Picks previously allocated stock: releases the hold and drains layers
    /// FIFO in the same transaction.
    pub async fn pick(
        &self,
        position_id: Uuid,
        quantity: Decimal,
        reference_id: Option<Uuid>,
    ) -> Result<ConsumptionOutcome, ServiceError> {
        self.consume_allocated(position_id, quantity, reference_id, "pick", false)
            .await
    }

    /// Ships allocated stock. For serialized units the position is marked
    /// shipped with a timestamp; re-shipping is rejected.
    pub async fn ship(
        &self,
        position_id: Uuid,
        quantity: Decimal,
        reference_id: Option<Uuid>,
    ) -> Result<ConsumptionOutcome, ServiceError> {
        self.consume_allocated(position_id, quantity, reference_id, "shipment", true)
            .await
    }

    /// Signed quantity adjustment. Positive deltas append a layer (at the
    /// given unit cost, or the position's current average), negative deltas
    /// drain layers FIFO.
    #[instrument(skip(self))]
    pub async fn adjust(
        &self,
        position_id: Uuid,
        quantity_delta: Decimal,
        unit_cost: Option<Decimal>,
        note: Option<String>,
    ) -> Result<(), ServiceError> {
        if quantity_delta.is_zero() {
            return Err(ServiceError::InvalidInput(
                "adjustment delta cannot be zero".into(),
            ));
        }

        if quantity_delta > Decimal::ZERO {
            let db = self.db_pool.as_ref();
            let position = load_position(db, position_id).await?;
            let cost = unit_cost.unwrap_or(position.unit_cost);
            let layer = self
                .cost_layers
                .create_layer(NewLayerInput {
                    position_id,
                    received_at: None,
                    quantity: quantity_delta,
                    unit_cost: cost,
                    components: Vec::new(),
                    reference_type: ReferenceType::Adjustment,
                    reference_id: None,
                    expiry_date: None,
                    metadata: note.map(|n| {
                        let mut meta = LayerMetadata::default();
                        meta.extra
                            .insert("note".to_string(), serde_json::Value::String(n));
                        meta
                    }),
                })
                .await?;
            info!(position_id = %position_id, layer_id = %layer.id, "upward adjustment");
            Ok(())
        } else {
            self.consumption
                .consume(ConsumeRequest {
                    position_id,
                    quantity: -quantity_delta,
                    reference_type: ReferenceType::Adjustment.to_string(),
                    reference_id: None,
                    shortfall_policy: ShortfallPolicy::Abort,
                })
                .await?;
            Ok(())
        }
    }

    /// Returns stock into the ledger as a fresh layer at the stated unit
    /// cost, referenced to the RMA.
    #[instrument(skip(self))]
    pub async fn return_to_stock(
        &self,
        position_id: Uuid,
        quantity: Decimal,
        unit_cost: Decimal,
        rma_id: Option<Uuid>,
    ) -> Result<cost_layer::Model, ServiceError> {
        self.cost_layers
            .create_layer(NewLayerInput {
                position_id,
                received_at: None,
                quantity,
                unit_cost,
                components: Vec::new(),
                reference_type: ReferenceType::Rma,
                reference_id: rma_id,
                expiry_date: None,
                metadata: None,
            })
            .await
    }

    /// Moves quantity between positions, draining source layers FIFO and
    /// recreating each drained slice at the target with its original unit
    /// cost and receipt timestamp. Total recreated quantity must equal the
    /// quantity drained.
    #[instrument(skip(self))]
    pub async fn transfer(
        &self,
        source_position_id: Uuid,
        target_key: PositionKey,
        quantity: Decimal,
    ) -> Result<TransferResult, ServiceError> {
        if quantity <= Decimal::ZERO {
            return Err(ServiceError::InvalidInput(format!(
                "transfer quantity must be positive, got {}",
                quantity
            )));
        }

        let db = self.db_pool.as_ref();
        let scale = self.thresholds.currency_scale;

        let result = db
            .transaction::<_, TransferResult, ServiceError>(move |txn| {
                Box::pin(async move {
                    let source = load_position(txn, source_position_id).await?;
                    if source.is_serialized() {
                        if quantity != Decimal::ONE {
                            return Err(ServiceError::SerializedUnitViolation {
                                position_id: source_position_id,
                                reason: format!(
                                    "serialized transfer must move one unit, got {}",
                                    quantity
                                ),
                            });
                        }
                        if source.status() != Some(PositionStatus::Available) {
                            return Err(ServiceError::InvalidSerialState {
                                position_id: source_position_id,
                                reason: format!(
                                    "serial unit is {} and cannot transfer",
                                    source.status
                                ),
                            });
                        }
                    }
                    if !source.allow_negative && source.quantity_available < quantity {
                        return Err(ServiceError::InvalidOperation(format!(
                            "cannot transfer {}: only {} available",
                            quantity, source.quantity_available
                        )));
                    }
                    bump_position_version(txn, &source).await?;

                    let (target, created) =
                        find_or_create_position(txn, &target_key, source.category.as_deref())
                            .await?;
                    if target.id == source.id {
                        return Err(ServiceError::InvalidOperation(
                            "transfer source and target are the same position".into(),
                        ));
                    }
                    if !created {
                        bump_position_version(txn, &target).await?;
                    }

                    // Keep the unit-cost slices of the drained source layers
                    // so the transfer preserves both cost and age.
                    let source_layers =
                        CostLayerService::layers_ordered_by_age(txn, source.id).await?;
                    let outcome = ConsumptionService::execute(
                        txn,
                        &source,
                        &ConsumeRequest {
                            position_id: source.id,
                            quantity,
                            reference_type: ReferenceType::Transfer.to_string(),
                            reference_id: Some(target.id),
                            shortfall_policy: ShortfallPolicy::Abort,
                        },
                        scale,
                    )
                    .await?;

                    let mut recreated = Decimal::ZERO;
                    for delta in &outcome.deltas {
                        let origin = source_layers
                            .iter()
                            .find(|l| l.id == delta.layer_id)
                            .ok_or_else(|| {
                                ServiceError::InternalError(format!(
                                    "drained layer {} not loaded",
                                    delta.layer_id
                                ))
                            })?;

                        CostLayerService::insert_layer(
                            txn,
                            &NewLayerInput {
                                position_id: target.id,
                                received_at: Some(origin.received_at),
                                quantity: delta.quantity_delta,
                                unit_cost: origin.unit_cost,
                                components: Vec::new(),
                                reference_type: ReferenceType::Transfer,
                                reference_id: Some(source.id),
                                expiry_date: origin.expiry_date,
                                metadata: origin.metadata(),
                            },
                            scale,
                        )
                        .await?;
                        recreated += delta.quantity_delta;
                    }

                    if recreated != quantity {
                        return Err(ServiceError::LayerTransferMismatch {
                            source_position_id: source.id,
                            target_position_id: target.id,
                            moved: quantity,
                            recreated,
                        });
                    }

                    refresh_position_projection(txn, &source).await?;
                    refresh_position_projection(txn, &target).await?;

                    Ok(TransferResult {
                        source_position_id: source.id,
                        target_position_id: target.id,
                        quantity,
                        value_moved: outcome.cogs,
                        layers_recreated: outcome.deltas.len(),
                    })
                })
            })
            .await
            .map_err(map_txn_error)?;

        self.event_sender
            .send(Event::StockTransferred {
                source_position_id: result.source_position_id,
                target_position_id: result.target_position_id,
                quantity: result.quantity,
                value_moved: result.value_moved,
            })
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))?;

        Ok(result)
    }

    /// Shared pick/ship flow: release the hold, drain layers, and for
    /// serialized shipments stamp the shipment link.
    async fn consume_allocated(
        &self,
        position_id: Uuid,
        quantity: Decimal,
        reference_id: Option<Uuid>,
        reference_type: &str,
        shipping: bool,
    ) -> Result<ConsumptionOutcome, ServiceError> {
        let db = self.db_pool.as_ref();
        let scale = self.thresholds.currency_scale;
        let reference_type = reference_type.to_string();
        let event_reference = reference_type.clone();

        let (outcome, serial) = db
            .transaction::<_, (ConsumptionOutcome, Option<String>), ServiceError>(move |txn| {
                Box::pin(async move {
                    let position = load_position(txn, position_id).await?;
                    if quantity <= Decimal::ZERO {
                        return Err(ServiceError::InvalidInput(format!(
                            "{} quantity must be positive, got {}",
                            reference_type, quantity
                        )));
                    }
                    if position.quantity_allocated < quantity {
                        return Err(ServiceError::InvalidOperation(format!(
                            "cannot {} {}: only {} allocated",
                            reference_type, quantity, position.quantity_allocated
                        )));
                    }
                    if shipping && position.is_serialized() {
                        if position.shipped_at.is_some()
                            || position.status() == Some(PositionStatus::Shipped)
                        {
                            return Err(ServiceError::InvalidSerialState {
                                position_id,
                                reason: "serial unit already shipped".into(),
                            });
                        }
                    }
                    bump_position_version(txn, &position).await?;

                    // Release the hold first so the projection refresh sees
                    // the post-movement allocated quantity.
                    let mut active: inventory_position::ActiveModel = position.clone().into();
                    active.quantity_allocated = Set(position.quantity_allocated - quantity);
                    if shipping && position.is_serialized() {
                        active.status = Set(PositionStatus::Shipped.to_string());
                        active.shipped_at = Set(Some(Utc::now()));
                    }
                    active.updated_at = Set(Utc::now());
                    let position = active.update(txn).await.map_err(ServiceError::db_error)?;

                    let outcome = ConsumptionService::execute(
                        txn,
                        &position,
                        &ConsumeRequest {
                            position_id,
                            quantity,
                            reference_type: reference_type.clone(),
                            reference_id,
                            shortfall_policy: ShortfallPolicy::Abort,
                        },
                        scale,
                    )
                    .await?;

                    refresh_position_projection(txn, &position).await?;

                    let serial = if shipping && position.is_serialized() {
                        position.serial_number.clone()
                    } else {
                        None
                    };
                    Ok((outcome, serial))
                })
            })
            .await
            .map_err(map_txn_error)?;

        self.event_sender
            .send(Event::LayersConsumed {
                position_id,
                quantity,
                cogs: outcome.cogs,
                layers_touched: outcome.deltas.len(),
                reference_type: event_reference,
            })
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))?;

        if let Some(serial_number) = serial {
            self.event_sender
                .send(Event::SerialShipped {
                    position_id,
                    serial_number,
                })
                .await
                .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))?;
        }

        Ok(outcome)
    }
}

fn map_txn_error(e: TransactionError<ServiceError>) -> ServiceError {
    match e {
        TransactionError::Connection(db_err) => ServiceError::db_error(db_err),
        TransactionError::Transaction(service_err) => service_err,
    }
}

/// Finds the position for a natural key, creating it (with zeroed
/// quantities) if it does not exist yet.
pub(crate) async fn find_or_create_position<C: ConnectionTrait>(
    conn: &C,
    key: &PositionKey,
    category: Option<&str>,
) -> Result<(inventory_position::Model, bool), ServiceError> {
    let mut query = inventory_position::Entity::find()
        .filter(inventory_position::Column::OrganizationId.eq(key.organization_id))
        .filter(inventory_position::Column::ProductId.eq(key.product_id))
        .filter(inventory_position::Column::LocationId.eq(key.location_id));
    query = match &key.lot_number {
        Some(lot) => query.filter(inventory_position::Column::LotNumber.eq(lot.clone())),
        None => query.filter(inventory_position::Column::LotNumber.is_null()),
    };
    query = match &key.serial_number {
        Some(serial) => query.filter(inventory_position::Column::SerialNumber.eq(serial.clone())),
        None => query.filter(inventory_position::Column::SerialNumber.is_null()),
    };

    if let Some(existing) = query.one(conn).await.map_err(ServiceError::db_error)? {
        return Ok((existing, false));
    }

    let now = Utc::now();
    let id = Uuid::new_v4();
    let position = inventory_position::ActiveModel {
        id: Set(id),
        organization_id: Set(key.organization_id),
        product_id: Set(key.product_id),
        location_id: Set(key.location_id),
        lot_number: Set(key.lot_number.clone()),
        serial_number: Set(key.serial_number.clone()),
        quantity_on_hand: Set(Decimal::ZERO),
        quantity_allocated: Set(Decimal::ZERO),
        quantity_available: Set(Decimal::ZERO),
        unit_cost: Set(Decimal::ZERO),
        total_value: Set(Decimal::ZERO),
        allow_negative: Set(false),
        category: Set(category.map(|c| c.to_string())),
        status: Set(PositionStatus::Available.to_string()),
        shipped_at: Set(None),
        version: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    };
    // A concurrent first receipt for the same key loses the race on the
    // natural-key unique index; callers retry and find the winner's row.
    let created = position.insert(conn).await.map_err(|e| {
        if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
            ServiceError::ConcurrentModification(id)
        } else {
            ServiceError::db_error(e)
        }
    })?;
    Ok((created, true))
}

/// A serialized position can only receive its unit once: the same serial
/// must not already be on hand here or anywhere else in the organization.
async fn check_serial_receivable<C: ConnectionTrait>(
    conn: &C,
    position: &inventory_position::Model,
    just_created: bool,
) -> Result<(), ServiceError> {
    if !just_created && position.quantity_on_hand > Decimal::ZERO {
        return Err(ServiceError::InvalidSerialState {
            position_id: position.id,
            reason: "serial unit is already on hand".into(),
        });
    }

    if let Some(serial) = &position.serial_number {
        let elsewhere = inventory_position::Entity::find()
            .filter(inventory_position::Column::OrganizationId.eq(position.organization_id))
            .filter(inventory_position::Column::SerialNumber.eq(serial.clone()))
            .filter(inventory_position::Column::Id.ne(position.id))
            .filter(inventory_position::Column::QuantityOnHand.gt(Decimal::ZERO))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if let Some(other) = elsewhere {
            return Err(ServiceError::SerializedUnitViolation {
                position_id: position.id,
                reason: format!("serial {} already on hand at position {}", serial, other.id),
            });
        }
    }

    Ok(())
}
