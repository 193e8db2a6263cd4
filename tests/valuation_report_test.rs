mod common;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use costledger::services::movements::{ReceiptCommand, ReceiptLine};
use costledger::services::valuation::{ValuationFilter, ValuationMethod};

use common::{days_ago, TestApp};

#[tokio::test]
async fn value_position_matches_the_cached_projection() {
    let app = TestApp::new().await;
    let key = app.key();

    let receipt = app.receive(&key, dec!(6), dec!(2.50), days_ago(3)).await;
    app.receive(&key, dec!(4), dec!(4.00), days_ago(1)).await;

    let value = app
        .state
        .services
        .valuation
        .value_position(receipt.position_id)
        .await
        .unwrap();
    assert_eq!(value, dec!(31.00));
}

#[tokio::test]
async fn report_rolls_up_by_category_and_skips_uncategorized() {
    let app = TestApp::new().await;

    let mut lines = Vec::new();
    for (category, quantity, unit_cost) in [
        (Some("widgets"), dec!(10), dec!(1.00)),
        (Some("widgets"), dec!(5), dec!(2.00)),
        (Some("gadgets"), dec!(2), dec!(10.00)),
        (None, dec!(1), dec!(100.00)),
    ] {
        lines.push(ReceiptLine {
            key: app.key(),
            quantity,
            unit_cost,
            weight: Decimal::ZERO,
            category: category.map(str::to_string),
            expiry_date: None,
            metadata: None,
        });
    }
    app.state
        .services
        .movements
        .receive_shipment(ReceiptCommand {
            lines,
            additional_costs: Vec::new(),
            reference_id: None,
            received_at: Some(days_ago(1)),
        })
        .await
        .unwrap();

    let report = app
        .state
        .services
        .valuation
        .report(
            ValuationFilter {
                organization_id: Some(app.organization_id),
                ..Default::default()
            },
            ValuationMethod::Fifo,
        )
        .await
        .unwrap();

    // The uncategorized position counts toward the grand total only.
    assert_eq!(report.total_value, dec!(140.00));
    assert_eq!(report.total_units, dec!(18));
    assert_eq!(report.positions, 4);
    assert_eq!(report.distinct_products, 4);
    assert_eq!(report.by_category.len(), 2);

    let widgets = report
        .by_category
        .iter()
        .find(|g| g.key == "widgets")
        .unwrap();
    assert_eq!(widgets.total_value, dec!(20.00));
    assert_eq!(widgets.total_units, dec!(15));
    assert_eq!(widgets.positions, 2);
}

#[tokio::test]
async fn fifo_and_weighted_average_agree_on_a_consistent_ledger() {
    let app = TestApp::new().await;
    let key = app.key();
    app.receive(&key, dec!(8), dec!(3.00), days_ago(2)).await;

    let filter = ValuationFilter {
        organization_id: Some(app.organization_id),
        ..Default::default()
    };
    let fifo = app
        .state
        .services
        .valuation
        .report(filter.clone(), ValuationMethod::Fifo)
        .await
        .unwrap();
    let avg = app
        .state
        .services
        .valuation
        .report(filter, ValuationMethod::WeightedAverage)
        .await
        .unwrap();

    assert_eq!(fifo.total_value, dec!(24.00));
    assert_eq!(avg.total_value, dec!(24.00));
}

#[tokio::test]
async fn scope_filters_limit_the_report() {
    let app = TestApp::new().await;
    let key_a = app.key();
    let key_b = app.key();
    app.receive(&key_a, dec!(1), dec!(5.00), days_ago(1)).await;
    app.receive(&key_b, dec!(1), dec!(7.00), days_ago(1)).await;

    let report = app
        .state
        .services
        .valuation
        .report(
            ValuationFilter {
                organization_id: Some(app.organization_id),
                product_id: Some(key_a.product_id),
                ..Default::default()
            },
            ValuationMethod::Fifo,
        )
        .await
        .unwrap();
    assert_eq!(report.positions, 1);
    assert_eq!(report.total_value, dec!(5.00));
}
