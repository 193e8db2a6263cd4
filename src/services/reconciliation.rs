use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, Set, TransactionError, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::config::EngineThresholds;
use crate::costing::integrity::{DriftFinding, DriftKind, FinanceIntegritySummary};
use crate::costing::valuation as valuation_math;
use crate::db::DbPool;
use crate::entities::{
    cost_layer::{self, ReferenceType},
    layer_audit_entry::AuditAction,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

use super::{
    bump_position_version, layer_views, load_position, record_audit,
    refresh_position_projection, CostLayerService, FinanceIntegrityService,
};

/// Summary of one reconcile pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub dry_run: bool,
    pub scanned_rows: u64,
    pub flagged_positions: u64,
    pub repaired_missing_layers: u64,
    pub repaired_value_drift_rows: u64,
    pub clamped_invalid_layers: u64,
    /// Findings still open after the pass. Non-repairable categories
    /// (duplicate serials, shipment link mismatches) and anything beyond
    /// the batch limit stay open.
    pub remaining_mismatches: u64,
    pub post_integrity: FinanceIntegritySummary,
}

/// What the pass intends to do for one flagged position.
#[derive(Debug, Clone, Default)]
struct RepairPlan {
    clamp_layers: u64,
    synthesize_missing: bool,
    revalue: bool,
    total_drift: Decimal,
}

/// Repairs the drift the auditor found, one position per transaction, and
/// re-audits the touched scope afterwards. Repairs only ever run through an
/// explicit invocation of this service; the auditor never writes.
#[derive(Clone)]
pub struct ReconciliationService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    integrity: FinanceIntegrityService,
    thresholds: EngineThresholds,
}

impl ReconciliationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        integrity: FinanceIntegrityService,
        thresholds: EngineThresholds,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            integrity,
            thresholds,
        }
    }

    /// Runs one reconcile pass. `dry_run` computes and reports every repair
    /// without writing; `limit` caps flagged positions touched (defaults to
    /// the configured batch limit).
    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        dry_run: bool,
        limit: Option<u64>,
    ) -> Result<ReconcileResult, ServiceError> {
        let db = self.db_pool.as_ref();
        let limit = limit.unwrap_or(self.thresholds.reconcile_batch_limit) as usize;

        let scan = self.integrity.scan(db, None, None).await?;
        let plans = Self::plan_repairs(&scan.findings);

        // Worst drift first, position id as the deterministic tiebreak.
        let mut ordered: Vec<(Uuid, RepairPlan)> = plans.into_iter().collect();
        ordered.sort_by(|a, b| {
            b.1.total_drift
                .cmp(&a.1.total_drift)
                .then(a.0.cmp(&b.0))
        });
        let flagged_positions = ordered.len() as u64;
        ordered.truncate(limit);

        let mut repaired_missing_layers = 0u64;
        let mut repaired_value_drift_rows = 0u64;
        let mut clamped_invalid_layers = 0u64;
        let mut touched: Vec<Uuid> = Vec::with_capacity(ordered.len());

        for (position_id, plan) in ordered {
            touched.push(position_id);

            if dry_run {
                clamped_invalid_layers += plan.clamp_layers;
                if plan.synthesize_missing {
                    repaired_missing_layers += 1;
                }
                if plan.revalue {
                    repaired_value_drift_rows += 1;
                }
                continue;
            }

            match self.repair_position(position_id).await {
                Ok(applied) => {
                    clamped_invalid_layers += applied.clamp_layers;
                    if applied.synthesize_missing {
                        repaired_missing_layers += 1;
                    }
                    if applied.revalue {
                        repaired_value_drift_rows += 1;
                    }
                }
                Err(e) => {
                    // One broken position must not block the rest of the
                    // batch; it stays flagged for the next pass.
                    error!(position_id = %position_id, error = %e, "reconcile repair failed");
                }
            }
        }

        let post_integrity = self.integrity.audit_positions(&touched).await?;
        let remaining_mismatches = post_integrity.total_findings();

        counter!("costledger_reconcile.runs", 1);
        counter!(
            "costledger_reconcile.repairs",
            repaired_missing_layers + repaired_value_drift_rows + clamped_invalid_layers
        );

        info!(
            dry_run,
            scanned_rows = scan.scanned,
            flagged_positions,
            repaired_missing_layers,
            repaired_value_drift_rows,
            clamped_invalid_layers,
            remaining_mismatches,
            "reconcile pass finished"
        );

        Ok(ReconcileResult {
            dry_run,
            scanned_rows: scan.scanned,
            flagged_positions,
            repaired_missing_layers,
            repaired_value_drift_rows,
            clamped_invalid_layers,
            remaining_mismatches,
            post_integrity,
        })
    }

    /// Folds raw findings into one repair plan per position. Non-repairable
    /// kinds contribute to the drift ranking but plan no writes.
    fn plan_repairs(findings: &[DriftFinding]) -> BTreeMap<Uuid, RepairPlan> {
        let mut plans: BTreeMap<Uuid, RepairPlan> = BTreeMap::new();
        for finding in findings {
            let plan = plans.entry(finding.position_id).or_default();
            plan.total_drift += finding.absolute_drift;
            match finding.kind {
                DriftKind::NegativeOrOverconsumedLayers => plan.clamp_layers += 1,
                DriftKind::StockWithoutActiveLayers => plan.synthesize_missing = true,
                DriftKind::InventoryValueMismatch => plan.revalue = true,
                DriftKind::DuplicateActiveSerializedAllocations
                | DriftKind::ShipmentLinkStatusMismatch => {}
            }
        }
        plans
    }

    /// Applies every repair one position needs in a single transaction:
    /// clamp invalid layers, synthesize a cover layer for uncovered stock,
    /// then recompute the cached projection from the ledger.
    async fn repair_position(&self, position_id: Uuid) -> Result<RepairPlan, ServiceError> {
        let db = self.db_pool.as_ref();

        let applied = db
            .transaction::<_, RepairPlan, ServiceError>(move |txn| {
                Box::pin(async move {
                    let position = load_position(txn, position_id).await?;
                    bump_position_version(txn, &position).await?;

                    let mut applied = RepairPlan::default();
                    let mut layers =
                        CostLayerService::layers_ordered_by_age(txn, position_id).await?;

                    for layer in layers.iter_mut() {
                        let clamped = layer
                            .quantity_remaining
                            .clamp(Decimal::ZERO, layer.quantity_received);
                        if clamped == layer.quantity_remaining {
                            continue;
                        }
                        let delta = clamped - layer.quantity_remaining;

                        let mut active: cost_layer::ActiveModel = layer.clone().into();
                        active.quantity_remaining = Set(clamped);
                        active.updated_at = Set(Utc::now());
                        *layer = active.update(txn).await.map_err(ServiceError::db_error)?;

                        record_audit(
                            txn,
                            position_id,
                            Some(layer.id),
                            AuditAction::Clamp,
                            delta.abs(),
                            (delta * layer.unit_cost).abs(),
                            &ReferenceType::Reconciliation.to_string(),
                            None,
                            Some(format!("remaining clamped to {}", clamped)),
                        )
                        .await?;
                        applied.clamp_layers += 1;
                    }

                    let active_quantity = valuation_math::remaining_quantity(&layer_views(&layers));
                    if position.quantity_on_hand > Decimal::ZERO
                        && active_quantity <= Decimal::ZERO
                    {
                        Self::synthesize_cover_layer(txn, &position, &layers).await?;
                        applied.synthesize_missing = true;
                    }

                    let old_value = position.total_value;
                    let updated = refresh_position_projection(txn, &position).await?;
                    if updated.total_value != old_value {
                        record_audit(
                            txn,
                            position_id,
                            None,
                            AuditAction::Revalue,
                            Decimal::ZERO,
                            (updated.total_value - old_value).abs(),
                            &ReferenceType::Reconciliation.to_string(),
                            None,
                            Some(format!(
                                "total value {} recomputed from layers, was {}",
                                updated.total_value, old_value
                            )),
                        )
                        .await?;
                        applied.revalue = true;
                    }

                    Ok(applied)
                })
            })
            .await
            .map_err(|e| match e {
                TransactionError::Connection(db_err) => ServiceError::db_error(db_err),
                TransactionError::Transaction(service_err) => service_err,
            })?;

        self.event_sender
            .send(Event::ReconciliationApplied {
                position_id,
                dry_run: false,
                synthesized_layers: applied.synthesize_missing as u64,
                revalued: applied.revalue,
                clamped_layers: applied.clamp_layers,
            })
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))?;

        Ok(applied)
    }

    /// Creates the synthetic layer covering on-hand stock that has no active
    /// layer behind it, priced at the position's cached average cost so the
    /// repair is value-neutral where the cache was right.
    async fn synthesize_cover_layer<C: ConnectionTrait>(
        conn: &C,
        position: &crate::entities::inventory_position::Model,
        layers: &[cost_layer::Model],
    ) -> Result<(), ServiceError> {
        let sequence = layers.iter().map(|l| l.sequence).max().unwrap_or(0) + 1;
        let now = Utc::now();
        let layer_id = Uuid::new_v4();

        let layer = cost_layer::ActiveModel {
            id: Set(layer_id),
            position_id: Set(position.id),
            received_at: Set(now),
            sequence: Set(sequence),
            quantity_received: Set(position.quantity_on_hand),
            quantity_remaining: Set(position.quantity_on_hand),
            unit_cost: Set(position.unit_cost),
            reference_type: Set(ReferenceType::Reconciliation.to_string()),
            reference_id: Set(None),
            expiry_date: Set(None),
            metadata: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        layer.insert(conn).await.map_err(ServiceError::db_error)?;

        record_audit(
            conn,
            position.id,
            Some(layer_id),
            AuditAction::Synthesize,
            position.quantity_on_hand,
            position.quantity_on_hand * position.unit_cost,
            &ReferenceType::Reconciliation.to_string(),
            None,
            Some("cover layer for stock without active layers".into()),
        )
        .await?;

        Ok(())
    }
}
