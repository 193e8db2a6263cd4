use rust_decimal::Decimal;

use super::LayerView;

/// Total monetary value remaining in a layer set.
pub fn remaining_value(layers: &[LayerView]) -> Decimal {
    layers.iter().map(LayerView::remaining_value).sum()
}

/// Total quantity remaining in a layer set.
pub fn remaining_quantity(layers: &[LayerView]) -> Decimal {
    layers.iter().map(|l| l.quantity_remaining).sum()
}

/// Weighted-average unit cost of the remaining layers. Positions holding no
/// stock carry a zero unit cost rather than a stale one.
pub fn weighted_average_unit_cost(layers: &[LayerView]) -> Decimal {
    let quantity = remaining_quantity(layers);
    if quantity.is_zero() {
        return Decimal::ZERO;
    }
    remaining_value(layers) / quantity
}
