use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::entities::inventory_position::PositionStatus;

/// Everything the auditor needs to know about one position, detached from
/// the ORM so classification stays pure and testable.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFacts {
    pub id: Uuid,
    pub quantity_on_hand: Decimal,
    pub quantity_allocated: Decimal,
    pub total_value: Decimal,
    pub serial_number: Option<String>,
    pub status: Option<PositionStatus>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub layers: Vec<LayerFacts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerFacts {
    pub id: Uuid,
    pub quantity_received: Decimal,
    pub quantity_remaining: Decimal,
    pub unit_cost: Decimal,
}

impl PositionFacts {
    /// Value recomputed from the layer ledger — the source of truth the
    /// cached `total_value` is compared against.
    pub fn layer_value(&self) -> Decimal {
        self.layers
            .iter()
            .map(|l| l.quantity_remaining * l.unit_cost)
            .sum()
    }

    pub fn has_active_layers(&self) -> bool {
        self.layers
            .iter()
            .any(|l| l.quantity_remaining > Decimal::ZERO)
    }
}

/// Drift categories the auditor detects.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum DriftKind {
    StockWithoutActiveLayers,
    InventoryValueMismatch,
    NegativeOrOverconsumedLayers,
    DuplicateActiveSerializedAllocations,
    ShipmentLinkStatusMismatch,
}

impl DriftKind {
    /// Hard violations always grade the summary red; soft drift alone stays
    /// amber as long as it remains under the configured ceiling.
    pub fn is_hard_violation(&self) -> bool {
        matches!(
            self,
            DriftKind::NegativeOrOverconsumedLayers
                | DriftKind::DuplicateActiveSerializedAllocations
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub position_id: Uuid,
    pub kind: DriftKind,
    pub absolute_drift: Decimal,
    pub detail: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum IntegrityStatus {
    Green,
    Amber,
    Red,
}

/// One entry of the worst-drifted ranking inside the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftedPosition {
    pub position_id: Uuid,
    pub absolute_drift: Decimal,
    pub kinds: Vec<DriftKind>,
}

/// Point-in-time integrity report. Computed on demand, `as_of`-stamped, and
/// optionally persisted as a snapshot for trend tracking. Drift reported
/// here is never auto-corrected; repair happens only through an explicit
/// reconcile invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinanceIntegritySummary {
    pub as_of: DateTime<Utc>,
    pub status: IntegrityStatus,
    pub scanned_positions: u64,
    pub stock_without_active_layers: u64,
    pub inventory_value_mismatch: u64,
    pub negative_or_overconsumed_layers: u64,
    pub duplicate_serialized_allocations: u64,
    pub shipment_link_status_mismatch: u64,
    pub total_absolute_drift: Decimal,
    pub worst_positions: Vec<DriftedPosition>,
}

impl FinanceIntegritySummary {
    pub fn total_findings(&self) -> u64 {
        self.stock_without_active_layers
            + self.inventory_value_mismatch
            + self.negative_or_overconsumed_layers
            + self.duplicate_serialized_allocations
            + self.shipment_link_status_mismatch
    }
}

/// Classifies one position's per-row drift categories. Cross-position
/// categories (duplicate serials) are handled by [`find_duplicate_serials`].
pub fn classify_position(facts: &PositionFacts, tolerance: Decimal) -> Vec<DriftFinding> {
    let mut findings = Vec::new();

    if facts.quantity_on_hand > Decimal::ZERO && !facts.has_active_layers() {
        findings.push(DriftFinding {
            position_id: facts.id,
            kind: DriftKind::StockWithoutActiveLayers,
            // The whole cached value is uncovered by layers.
            absolute_drift: facts.total_value.abs(),
            detail: format!(
                "{} on hand with no active cost layers",
                facts.quantity_on_hand
            ),
        });
    }

    let drift = (facts.total_value - facts.layer_value()).abs();
    if drift > tolerance {
        findings.push(DriftFinding {
            position_id: facts.id,
            kind: DriftKind::InventoryValueMismatch,
            absolute_drift: drift,
            detail: format!(
                "cached total_value {} vs layer value {}",
                facts.total_value,
                facts.layer_value()
            ),
        });
    }

    for layer in &facts.layers {
        if layer.quantity_remaining < Decimal::ZERO
            || layer.quantity_remaining > layer.quantity_received
        {
            findings.push(DriftFinding {
                position_id: facts.id,
                kind: DriftKind::NegativeOrOverconsumedLayers,
                absolute_drift: (layer.quantity_remaining * layer.unit_cost).abs(),
                detail: format!(
                    "layer {} remaining {} outside [0, {}]",
                    layer.id, layer.quantity_remaining, layer.quantity_received
                ),
            });
        }
    }

    if facts.serial_number.is_some() {
        let shipped = facts.shipped_at.is_some();
        let status_shipped = facts.status == Some(PositionStatus::Shipped);
        if shipped != status_shipped {
            findings.push(DriftFinding {
                position_id: facts.id,
                kind: DriftKind::ShipmentLinkStatusMismatch,
                absolute_drift: Decimal::ZERO,
                detail: format!(
                    "shipped_at {:?} disagrees with status {:?}",
                    facts.shipped_at, facts.status
                ),
            });
        }
    }

    findings
}

/// Flags serial numbers carried by more than one actively-allocated
/// position. Shipped and retired positions no longer hold the serial.
pub fn find_duplicate_serials(positions: &[PositionFacts]) -> Vec<DriftFinding> {
    let mut by_serial: BTreeMap<&str, Vec<&PositionFacts>> = BTreeMap::new();
    for p in positions {
        if let Some(serial) = p.serial_number.as_deref() {
            let active = p.quantity_allocated > Decimal::ZERO
                && !matches!(
                    p.status,
                    Some(PositionStatus::Shipped) | Some(PositionStatus::Retired)
                );
            if active {
                by_serial.entry(serial).or_default().push(p);
            }
        }
    }

    let mut findings = Vec::new();
    for (serial, holders) in by_serial {
        if holders.len() > 1 {
            for p in holders {
                findings.push(DriftFinding {
                    position_id: p.id,
                    kind: DriftKind::DuplicateActiveSerializedAllocations,
                    absolute_drift: Decimal::ZERO,
                    detail: format!("serial {serial} allocated on multiple positions"),
                });
            }
        }
    }
    findings
}

/// Assembles the graded summary from raw findings.
///
/// Severity: red when any hard violation exists or any single position's
/// value drift exceeds `amber_ceiling`; amber when only soft drift exists;
/// green otherwise. The worst-drifted list is ranked by absolute drift
/// descending with position id as the deterministic tiebreak.
pub fn summarize(
    as_of: DateTime<Utc>,
    scanned_positions: u64,
    findings: &[DriftFinding],
    amber_ceiling: Decimal,
    top_limit: usize,
) -> FinanceIntegritySummary {
    let mut counts: BTreeMap<DriftKind, u64> = BTreeMap::new();
    let mut per_position: BTreeMap<Uuid, DriftedPosition> = BTreeMap::new();
    let mut total_drift = Decimal::ZERO;
    let mut red = false;

    for finding in findings {
        *counts.entry(finding.kind).or_insert(0) += 1;
        total_drift += finding.absolute_drift;

        if finding.kind.is_hard_violation() {
            red = true;
        }
        if finding.kind == DriftKind::InventoryValueMismatch
            && finding.absolute_drift > amber_ceiling
        {
            red = true;
        }

        let entry = per_position
            .entry(finding.position_id)
            .or_insert_with(|| DriftedPosition {
                position_id: finding.position_id,
                absolute_drift: Decimal::ZERO,
                kinds: Vec::new(),
            });
        entry.absolute_drift += finding.absolute_drift;
        if !entry.kinds.contains(&finding.kind) {
            entry.kinds.push(finding.kind);
        }
    }

    let status = if red {
        IntegrityStatus::Red
    } else if findings.is_empty() {
        IntegrityStatus::Green
    } else {
        IntegrityStatus::Amber
    };

    let mut worst: Vec<DriftedPosition> = per_position.into_values().collect();
    worst.sort_by(|a, b| {
        b.absolute_drift
            .cmp(&a.absolute_drift)
            .then(a.position_id.cmp(&b.position_id))
    });
    worst.truncate(top_limit);

    FinanceIntegritySummary {
        as_of,
        status,
        scanned_positions,
        stock_without_active_layers: counts
            .get(&DriftKind::StockWithoutActiveLayers)
            .copied()
            .unwrap_or(0),
        inventory_value_mismatch: counts
            .get(&DriftKind::InventoryValueMismatch)
            .copied()
            .unwrap_or(0),
        negative_or_overconsumed_layers: counts
            .get(&DriftKind::NegativeOrOverconsumedLayers)
            .copied()
            .unwrap_or(0),
        duplicate_serialized_allocations: counts
            .get(&DriftKind::DuplicateActiveSerializedAllocations)
            .copied()
            .unwrap_or(0),
        shipment_link_status_mismatch: counts
            .get(&DriftKind::ShipmentLinkStatusMismatch)
            .copied()
            .unwrap_or(0),
        total_absolute_drift: total_drift,
        worst_positions: worst,
    }
}
