//! Property tests over the pure costing core: penny conservation of the
//! landed-cost allocator and value conservation of the FIFO walk.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

use costledger::costing::fifo::plan_consumption;
use costledger::costing::landed_cost::{allocate, AllocationItem, AllocationMethod};
use costledger::costing::valuation::{remaining_quantity, remaining_value};
use costledger::costing::LayerView;

fn money(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

fn method_strategy() -> impl Strategy<Value = AllocationMethod> {
    prop_oneof![
        Just(AllocationMethod::Equal),
        Just(AllocationMethod::ByValue),
        Just(AllocationMethod::ByWeight),
        Just(AllocationMethod::ByQuantity),
    ]
}

fn items_strategy() -> impl Strategy<Value = Vec<AllocationItem>> {
    // Strictly positive bases so every method has a usable total.
    prop::collection::vec((1i64..100_000, 1i64..10_000, 1i64..1_000), 1..8).prop_map(|rows| {
        rows.into_iter()
            .map(|(value, weight, quantity)| AllocationItem {
                id: Uuid::new_v4(),
                value: money(value),
                weight: Decimal::new(weight, 1),
                quantity: Decimal::from(quantity),
            })
            .collect()
    })
}

fn layers_strategy() -> impl Strategy<Value = Vec<LayerView>> {
    prop::collection::vec((1i64..10_000, 0i64..100_000, 0i64..3_650), 1..12).prop_map(|rows| {
        let epoch = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        rows.into_iter()
            .enumerate()
            .map(|(i, (quantity, unit_cents, age_days))| LayerView {
                id: Uuid::new_v4(),
                received_at: epoch + Duration::days(age_days),
                sequence: i as i64 + 1,
                quantity_remaining: Decimal::from(quantity),
                unit_cost: money(unit_cents),
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn allocation_never_leaks_a_penny(
        cost_cents in -1_000_000i64..1_000_000,
        method in method_strategy(),
        items in items_strategy(),
    ) {
        let cost = money(cost_cents);
        let shares = allocate(cost, method, &items, 2).unwrap();

        prop_assert_eq!(shares.len(), items.len());
        let total: Decimal = shares.iter().map(|s| s.amount).sum();
        prop_assert_eq!(total, cost);
    }

    #[test]
    fn allocation_shares_stay_within_one_minor_unit_of_exact(
        cost_cents in 1i64..1_000_000,
        items in items_strategy(),
    ) {
        let cost = money(cost_cents);
        let shares = allocate(cost, AllocationMethod::ByValue, &items, 2).unwrap();

        let total_basis: Decimal = items.iter().map(|i| i.value).sum();
        for (item, share) in items.iter().zip(&shares) {
            let exact = cost * item.value / total_basis;
            prop_assert!((share.amount - exact).abs() <= Decimal::new(1, 2),
                "share {} strays from exact {}", share.amount, exact);
        }
    }

    #[test]
    fn fifo_walk_conserves_value(
        layers in layers_strategy(),
        quantity_numerator in 0u32..100,
    ) {
        let available = remaining_quantity(&layers);
        let quantity = available * Decimal::from(quantity_numerator) / Decimal::ONE_HUNDRED;
        let initial_value = remaining_value(&layers);

        let plan = plan_consumption(&layers, quantity).unwrap();

        let delta_cost: Decimal = plan.deltas.iter().map(|d| d.cost_delta).sum();
        prop_assert_eq!(delta_cost, plan.cogs);
        prop_assert_eq!(plan.cogs + remaining_value(&plan.remaining_layers), initial_value);
        prop_assert_eq!(remaining_quantity(&plan.remaining_layers), available - quantity);
        prop_assert!(plan
            .remaining_layers
            .iter()
            .all(|l| l.quantity_remaining >= Decimal::ZERO));
    }

    #[test]
    fn fifo_plan_is_input_order_independent(layers in layers_strategy()) {
        let quantity = remaining_quantity(&layers) / Decimal::TWO;
        let forward = plan_consumption(&layers, quantity).unwrap();

        let mut reversed = layers.clone();
        reversed.reverse();
        let backward = plan_consumption(&reversed, quantity).unwrap();

        prop_assert_eq!(forward.cogs, backward.cogs);
        prop_assert_eq!(forward.deltas, backward.deltas);
    }

    #[test]
    fn overdraw_always_reports_the_exact_gap(
        layers in layers_strategy(),
        extra in 1i64..1_000,
    ) {
        let available = remaining_quantity(&layers);
        let requested = available + Decimal::from(extra);
        let shortfall = plan_consumption(&layers, requested).unwrap_err();

        prop_assert_eq!(shortfall.available, available);
        prop_assert_eq!(shortfall.requested, requested);
        prop_assert_eq!(shortfall.missing, Decimal::from(extra));
    }
}
