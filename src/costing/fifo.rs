use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{LayerDelta, LayerView};
use crate::entities::layer_audit_entry::AuditAction;

/// Outcome of a FIFO walk over a position's layers.
///
/// `remaining_layers` is the full layer set with post-consumption quantities
/// in FIFO order, including layers drained to zero. The simulated and the
/// applying consumption paths both return exactly this plan; the only
/// difference between them is persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionPlan {
    pub cogs: Decimal,
    pub deltas: Vec<LayerDelta>,
    pub remaining_layers: Vec<LayerView>,
}

/// The walk ran out of layers before the request was satisfied.
/// The caller decides whether to abort (`InsufficientCostLayers`) or to
/// cover the gap with an explicit synthetic zero-cost layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortfall {
    pub requested: Decimal,
    pub available: Decimal,
    pub missing: Decimal,
}

/// Selects and drains layers oldest-first for a withdrawal of `quantity`.
///
/// Per layer the walk withdraws `min(outstanding, layer.remaining)`,
/// accumulates `withdrawn * unit_cost` into COGS, and emits one delta.
/// `sum(deltas.cost_delta) == cogs` holds exactly — both sides are built
/// from the same products, no re-rounding on either path.
pub fn plan_consumption(
    layers: &[LayerView],
    quantity: Decimal,
) -> Result<ConsumptionPlan, Shortfall> {
    let mut ordered: Vec<LayerView> = layers.to_vec();
    ordered.sort_by(|a, b| {
        a.received_at
            .cmp(&b.received_at)
            .then(a.sequence.cmp(&b.sequence))
    });

    let available: Decimal = ordered.iter().map(|l| l.quantity_remaining).sum();
    if available < quantity {
        return Err(Shortfall {
            requested: quantity,
            available,
            missing: quantity - available,
        });
    }

    let mut outstanding = quantity;
    let mut cogs = Decimal::ZERO;
    let mut deltas = Vec::new();

    for layer in ordered.iter_mut() {
        if outstanding.is_zero() {
            break;
        }
        if layer.quantity_remaining <= Decimal::ZERO {
            continue;
        }

        let withdrawn = outstanding.min(layer.quantity_remaining);
        let cost = withdrawn * layer.unit_cost;

        layer.quantity_remaining -= withdrawn;
        outstanding -= withdrawn;
        cogs += cost;

        deltas.push(LayerDelta {
            layer_id: layer.id,
            quantity_delta: withdrawn,
            cost_delta: cost,
            action: AuditAction::Consume,
        });
    }

    Ok(ConsumptionPlan {
        cogs,
        deltas,
        remaining_layers: ordered,
    })
}
