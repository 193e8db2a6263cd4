use chrono::Utc;
use metrics::{counter, gauge};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineThresholds;
use crate::costing::integrity::{
    classify_position, find_duplicate_serials, summarize, DriftFinding, FinanceIntegritySummary,
    IntegrityStatus, LayerFacts, PositionFacts,
};
use crate::db::DbPool;
use crate::entities::{cost_layer, integrity_snapshot, inventory_position};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Raw result of one integrity scan, before summarization. The reconciler
/// consumes this to decide what to repair.
#[derive(Debug, Clone)]
pub(crate) struct ScanOutcome {
    pub scanned: u64,
    pub findings: Vec<DriftFinding>,
}

/// Read-only drift detector. Compares every scanned position's cached
/// projection against its layer ledger and grades the result; it never
/// repairs anything itself.
#[derive(Clone)]
pub struct FinanceIntegrityService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    thresholds: EngineThresholds,
}

impl FinanceIntegrityService {
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

    /// Audits up to `max_audit_rows` positions and grades the result.
    /// `tolerance` and `top_limit` default to the configured thresholds.
    #[instrument(skip(self))]
    pub async fn audit(
        &self,
        tolerance: Option<Decimal>,
        top_limit: Option<u64>,
    ) -> Result<FinanceIntegritySummary, ServiceError> {
        let outcome = self
            .scan(self.db_pool.as_ref(), None, tolerance)
            .await?;
        self.grade_and_report(outcome, top_limit).await
    }

    /// Audits only the given positions. Used for post-reconcile verification
    /// and targeted spot checks.
    pub async fn audit_positions(
        &self,
        position_ids: &[Uuid],
    ) -> Result<FinanceIntegritySummary, ServiceError> {
        let outcome = self
            .scan(self.db_pool.as_ref(), Some(position_ids), None)
            .await?;
        self.grade_and_report(outcome, None).await
    }

    /// Persists a summary as a snapshot row for trend tracking.
    pub async fn persist_snapshot(
        &self,
        summary: &FinanceIntegritySummary,
    ) -> Result<integrity_snapshot::Model, ServiceError> {
        let worst = serde_json::to_value(&summary.worst_positions)
            .map_err(|e| ServiceError::InternalError(format!("snapshot serialization: {}", e)))?;

        let snapshot = integrity_snapshot::ActiveModel {
            id: Set(Uuid::new_v4()),
            as_of: Set(summary.as_of),
            status: Set(summary.status.to_string()),
            scanned_positions: Set(summary.scanned_positions as i64),
            stock_without_active_layers: Set(summary.stock_without_active_layers as i64),
            inventory_value_mismatch: Set(summary.inventory_value_mismatch as i64),
            negative_or_overconsumed_layers: Set(summary.negative_or_overconsumed_layers as i64),
            duplicate_serialized_allocations: Set(summary.duplicate_serialized_allocations as i64),
            shipment_link_status_mismatch: Set(summary.shipment_link_status_mismatch as i64),
            total_absolute_drift: Set(summary.total_absolute_drift),
            worst_positions: Set(worst),
            created_at: Set(Utc::now()),
        };

        snapshot
            .insert(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    /// Scans positions (all, capped at `max_audit_rows`, or a given id set)
    /// and classifies each against its layer ledger.
    pub(crate) async fn scan<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: Option<&[Uuid]>,
        tolerance: Option<Decimal>,
    ) -> Result<ScanOutcome, ServiceError> {
        let tolerance = tolerance.unwrap_or(self.thresholds.value_drift_tolerance);

        let mut query = inventory_position::Entity::find()
            .order_by_asc(inventory_position::Column::Id);
        match scope {
            Some(ids) => {
                query = query.filter(inventory_position::Column::Id.is_in(ids.to_vec()));
            }
            None => {
                query = query.limit(self.thresholds.max_audit_rows);
            }
        }
        let positions = query.all(conn).await.map_err(ServiceError::db_error)?;

        let facts = Self::load_facts(conn, &positions).await?;

        let mut findings = Vec::new();
        for fact in &facts {
            findings.extend(classify_position(fact, tolerance));
        }
        findings.extend(find_duplicate_serials(&facts));

        Ok(ScanOutcome {
            scanned: facts.len() as u64,
            findings,
        })
    }

    /// Joins positions with their layers into the facts the pure classifier
    /// operates on.
    pub(crate) async fn load_facts<C: ConnectionTrait>(
        conn: &C,
        positions: &[inventory_position::Model],
    ) -> Result<Vec<PositionFacts>, ServiceError> {
        let ids: Vec<Uuid> = positions.iter().map(|p| p.id).collect();
        let mut layers_by_position: HashMap<Uuid, Vec<LayerFacts>> = HashMap::new();

        if !ids.is_empty() {
            let layers = cost_layer::Entity::find()
                .filter(cost_layer::Column::PositionId.is_in(ids))
                .all(conn)
                .await
                .map_err(ServiceError::db_error)?;
            for layer in layers {
                layers_by_position
                    .entry(layer.position_id)
                    .or_default()
                    .push(LayerFacts {
                        id: layer.id,
                        quantity_received: layer.quantity_received,
                        quantity_remaining: layer.quantity_remaining,
                        unit_cost: layer.unit_cost,
                    });
            }
        }

        Ok(positions
            .iter()
            .map(|p| PositionFacts {
                id: p.id,
                quantity_on_hand: p.quantity_on_hand,
                quantity_allocated: p.quantity_allocated,
                total_value: p.total_value,
                serial_number: p.serial_number.clone(),
                status: p.status(),
                shipped_at: p.shipped_at,
                layers: layers_by_position.remove(&p.id).unwrap_or_default(),
            })
            .collect())
    }

    async fn grade_and_report(
        &self,
        outcome: ScanOutcome,
        top_limit: Option<u64>,
    ) -> Result<FinanceIntegritySummary, ServiceError> {
        let top_limit = top_limit.unwrap_or(self.thresholds.top_drift_limit) as usize;
        let summary = summarize(
            Utc::now(),
            outcome.scanned,
            &outcome.findings,
            self.thresholds.amber_drift_ceiling,
            top_limit,
        );

        counter!("costledger_audit.runs", 1);
        gauge!(
            "costledger_audit.flagged_positions",
            summary.total_findings() as f64
        );
        gauge!(
            "costledger_audit.total_absolute_drift",
            summary.total_absolute_drift.to_f64().unwrap_or(0.0)
        );

        match summary.status {
            IntegrityStatus::Green => {
                info!(
                    scanned = summary.scanned_positions,
                    "integrity audit green"
                );
            }
            _ => {
                warn!(
                    status = %summary.status,
                    scanned = summary.scanned_positions,
                    findings = summary.total_findings(),
                    total_absolute_drift = %summary.total_absolute_drift,
                    "integrity audit found drift"
                );
                self.event_sender
                    .send(Event::DriftDetected {
                        as_of: summary.as_of,
                        status: summary.status.to_string(),
                        total_absolute_drift: summary.total_absolute_drift,
                        flagged_positions: summary.total_findings(),
                    })
                    .await
                    .map_err(|e| {
                        ServiceError::EventError(format!("Failed to send event: {}", e))
                    })?;
            }
        }

        Ok(summary)
    }
}
