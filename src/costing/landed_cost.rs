use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// How an additional cost is spread across the line items of a receipt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum AllocationMethod {
    Equal,
    ByValue,
    ByWeight,
    ByQuantity,
}

/// One receipt line item carrying every basis the methods can weight by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationItem {
    pub id: Uuid,
    pub value: Decimal,
    pub weight: Decimal,
    pub quantity: Decimal,
}

/// One item's rounded share of the allocated cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub item_id: Uuid,
    pub amount: Decimal,
}

/// Distributes `cost_amount` across `items`, proportional to the method's
/// basis, rounded to `scale` minor-unit digits.
///
/// Shares are computed at full precision and then settled with
/// largest-remainder rounding, so the rounded shares always sum to
/// `cost_amount` exactly — no penny ever leaks, even when the item count
/// exceeds the cost in minor units.
pub fn allocate(
    cost_amount: Decimal,
    method: AllocationMethod,
    items: &[AllocationItem],
    scale: u32,
) -> Result<Vec<Allocation>, ServiceError> {
    if items.is_empty() {
        return Err(ServiceError::LandedCostAllocationConflict(
            "cannot allocate cost across zero items".into(),
        ));
    }

    // The shares settle at `scale`, so the amount itself must be
    // expressible there or the settled total silently drifts from it.
    if cost_amount.round_dp(scale) != cost_amount {
        return Err(ServiceError::LandedCostAllocationConflict(format!(
            "cost amount {cost_amount} has sub-minor-unit precision at scale {scale}"
        )));
    }

    let bases: Vec<Decimal> = items
        .iter()
        .map(|item| match method {
            AllocationMethod::Equal => Decimal::ONE,
            AllocationMethod::ByValue => item.value,
            AllocationMethod::ByWeight => item.weight,
            AllocationMethod::ByQuantity => item.quantity,
        })
        .collect();

    if bases.iter().any(|b| b.is_sign_negative()) {
        return Err(ServiceError::LandedCostAllocationConflict(format!(
            "negative allocation basis for method {method}"
        )));
    }

    let total_basis: Decimal = bases.iter().sum();
    if total_basis.is_zero() {
        return Err(ServiceError::LandedCostAllocationConflict(format!(
            "total allocation basis is zero for method {method}"
        )));
    }

    // Work on the magnitude; a negative cost amount (a credit) distributes
    // the same way with the sign restored at the end.
    let negative = cost_amount.is_sign_negative();
    let magnitude = cost_amount.abs();

    let raw: Vec<Decimal> = bases
        .iter()
        .map(|basis| magnitude * basis / total_basis)
        .collect();

    let mut floored: Vec<Decimal> = raw
        .iter()
        .map(|share| share.trunc_with_scale(scale))
        .collect();

    let minor_unit = Decimal::new(1, scale);
    let floored_sum: Decimal = floored.iter().sum();
    let mut leftover_units = ((magnitude - floored_sum) / minor_unit)
        .round()
        .to_i64()
        .unwrap_or(0);

    // Hand leftover minor units to the largest fractional remainders first;
    // index order breaks remainder ties deterministically.
    let mut order: Vec<usize> = (0..raw.len()).collect();
    order.sort_by(|&a, &b| {
        let rem_a = raw[a] - floored[a];
        let rem_b = raw[b] - floored[b];
        rem_b.cmp(&rem_a).then(a.cmp(&b))
    });

    for &idx in order.iter().cycle() {
        if leftover_units <= 0 {
            break;
        }
        floored[idx] += minor_unit;
        leftover_units -= 1;
    }

    Ok(items
        .iter()
        .zip(floored)
        .map(|(item, amount)| Allocation {
            item_id: item.id,
            amount: if negative { -amount } else { amount },
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn item(value: Decimal, weight: Decimal, quantity: Decimal) -> AllocationItem {
        AllocationItem {
            id: Uuid::new_v4(),
            value,
            weight,
            quantity,
        }
    }

    #[test]
    fn by_value_splits_proportionally() {
        let items = vec![
            item(dec!(300), dec!(1), dec!(1)),
            item(dec!(100), dec!(1), dec!(1)),
        ];
        let shares = allocate(dec!(100.00), AllocationMethod::ByValue, &items, 2).unwrap();
        assert_eq!(shares[0].amount, dec!(75.00));
        assert_eq!(shares[1].amount, dec!(25.00));
    }

    #[test]
    fn equal_split_settles_remainder_without_penny_drift() {
        let items = vec![
            item(dec!(1), dec!(1), dec!(1)),
            item(dec!(1), dec!(1), dec!(1)),
            item(dec!(1), dec!(1), dec!(1)),
        ];
        let shares = allocate(dec!(100.00), AllocationMethod::Equal, &items, 2).unwrap();
        let total: Decimal = shares.iter().map(|s| s.amount).sum();
        assert_eq!(total, dec!(100.00));
        // 33.34 + 33.33 + 33.33, largest remainder first.
        assert_eq!(shares[0].amount, dec!(33.34));
        assert_eq!(shares[1].amount, dec!(33.33));
        assert_eq!(shares[2].amount, dec!(33.33));
    }

    #[test]
    fn more_items_than_minor_units() {
        let items: Vec<AllocationItem> =
            (0..7).map(|_| item(dec!(1), dec!(1), dec!(1))).collect();
        let shares = allocate(dec!(0.05), AllocationMethod::Equal, &items, 2).unwrap();
        let total: Decimal = shares.iter().map(|s| s.amount).sum();
        assert_eq!(total, dec!(0.05));
        assert_eq!(
            shares.iter().filter(|s| s.amount == dec!(0.01)).count(),
            5
        );
        assert_eq!(shares.iter().filter(|s| s.amount.is_zero()).count(), 2);
    }

    #[rstest]
    #[case(AllocationMethod::ByValue)]
    #[case(AllocationMethod::ByWeight)]
    #[case(AllocationMethod::ByQuantity)]
    fn zero_basis_is_a_conflict(#[case] method: AllocationMethod) {
        let items = vec![item(dec!(0), dec!(0), dec!(0)), item(dec!(0), dec!(0), dec!(0))];
        let err = allocate(dec!(10.00), method, &items, 2).unwrap_err();
        assert_matches!(err, ServiceError::LandedCostAllocationConflict(_));
    }

    #[test]
    fn sub_minor_unit_amount_is_a_conflict() {
        let items = vec![item(dec!(1), dec!(1), dec!(1)), item(dec!(1), dec!(1), dec!(1))];
        let err = allocate(dec!(10.005), AllocationMethod::Equal, &items, 2).unwrap_err();
        assert_matches!(err, ServiceError::LandedCostAllocationConflict(_));
        // Trailing zeros past the scale are still the same amount.
        allocate(dec!(10.0500), AllocationMethod::Equal, &items, 2).unwrap();
    }

    #[test]
    fn empty_items_is_a_conflict() {
        let err = allocate(dec!(10.00), AllocationMethod::Equal, &[], 2).unwrap_err();
        assert_matches!(err, ServiceError::LandedCostAllocationConflict(_));
    }

    #[test]
    fn negative_cost_distributes_as_credit() {
        let items = vec![
            item(dec!(2), dec!(1), dec!(1)),
            item(dec!(1), dec!(1), dec!(1)),
        ];
        let shares = allocate(dec!(-30.00), AllocationMethod::ByValue, &items, 2).unwrap();
        let total: Decimal = shares.iter().map(|s| s.amount).sum();
        assert_eq!(total, dec!(-30.00));
        assert_eq!(shares[0].amount, dec!(-20.00));
    }

    #[test]
    fn by_weight_uses_weight_basis() {
        let items = vec![
            item(dec!(1), dec!(9), dec!(1)),
            item(dec!(1), dec!(1), dec!(1)),
        ];
        let shares = allocate(dec!(50.00), AllocationMethod::ByWeight, &items, 2).unwrap();
        assert_eq!(shares[0].amount, dec!(45.00));
        assert_eq!(shares[1].amount, dec!(5.00));
    }
}
