mod common;

use assert_matches::assert_matches;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;

use costledger::entities::{inventory_position, layer_audit_entry};
use costledger::errors::ServiceError;
use costledger::services::consumption::{ConsumeRequest, ShortfallPolicy};

use common::{days_ago, TestApp};

fn order_request(position_id: uuid::Uuid, quantity: Decimal) -> ConsumeRequest {
    ConsumeRequest {
        position_id,
        quantity,
        reference_type: "order".to_string(),
        reference_id: None,
        shortfall_policy: ShortfallPolicy::Abort,
    }
}

#[tokio::test]
async fn fifo_walk_drains_oldest_layer_first() {
    let app = TestApp::new().await;
    let key = app.key();

    let first = app.receive(&key, dec!(10), dec!(5.00), days_ago(10)).await;
    app.receive(&key, dec!(10), dec!(10.00), days_ago(5)).await;
    let position_id = first.position_id;

    let outcome = app
        .state
        .services
        .consumption
        .consume(order_request(position_id, dec!(12)))
        .await
        .expect("consumption failed");

    // 10 units at 5.00, then 2 units at 10.00.
    assert_eq!(outcome.cogs, dec!(70.00));
    assert_eq!(outcome.deltas.len(), 2);
    assert_eq!(outcome.deltas[0].quantity_delta, dec!(10));
    assert_eq!(outcome.deltas[0].cost_delta, dec!(50.00));
    assert_eq!(outcome.deltas[1].quantity_delta, dec!(2));
    assert_eq!(outcome.deltas[1].cost_delta, dec!(20.00));

    let delta_sum: Decimal = outcome.deltas.iter().map(|d| d.cost_delta).sum();
    assert_eq!(delta_sum, outcome.cogs);

    // The cached projection reflects the post-walk ledger exactly.
    let position = inventory_position::Entity::find_by_id(position_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_on_hand, dec!(8));
    assert_eq!(position.total_value, dec!(80.00));
}

#[tokio::test]
async fn simulate_matches_consume_on_identical_state() {
    let app = TestApp::new().await;
    let key = app.key();

    let first = app.receive(&key, dec!(4), dec!(3.25), days_ago(7)).await;
    app.receive(&key, dec!(6), dec!(4.75), days_ago(2)).await;

    let simulated = app
        .state
        .services
        .consumption
        .simulate(order_request(first.position_id, dec!(5)))
        .await
        .expect("simulate failed");
    let applied = app
        .state
        .services
        .consumption
        .consume(order_request(first.position_id, dec!(5)))
        .await
        .expect("consume failed");

    assert_eq!(simulated, applied);
}

#[tokio::test]
async fn simulate_writes_nothing() {
    let app = TestApp::new().await;
    let key = app.key();

    let receipt = app.receive(&key, dec!(10), dec!(2.00), days_ago(1)).await;
    let before = inventory_position::Entity::find_by_id(receipt.position_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();

    app.state
        .services
        .consumption
        .simulate(order_request(receipt.position_id, dec!(7)))
        .await
        .expect("simulate failed");

    let after = inventory_position::Entity::find_by_id(receipt.position_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn exact_drain_leaves_zero_and_one_more_unit_fails() {
    let app = TestApp::new().await;
    let key = app.key();
    let receipt = app.receive(&key, dec!(5), dec!(1.50), days_ago(3)).await;

    let outcome = app
        .state
        .services
        .consumption
        .consume(order_request(receipt.position_id, dec!(5)))
        .await
        .expect("exact drain failed");
    assert_eq!(outcome.cogs, dec!(7.50));
    assert!(outcome
        .remaining_layers
        .iter()
        .all(|l| l.quantity_remaining.is_zero()));

    let err = app
        .state
        .services
        .consumption
        .consume(order_request(receipt.position_id, dec!(1)))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InsufficientCostLayers {
            requested,
            available,
            ..
        } if requested == dec!(1) && available == Decimal::ZERO
    );
}

#[tokio::test]
async fn negative_quantity_is_rejected() {
    let app = TestApp::new().await;
    let key = app.key();
    let receipt = app.receive(&key, dec!(5), dec!(1.00), days_ago(1)).await;

    let err = app
        .state
        .services
        .consumption
        .consume(order_request(receipt.position_id, dec!(-1)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));
}

#[tokio::test]
async fn synthetic_policy_covers_shortfall_at_zero_cost() {
    let app = TestApp::new().await;
    let key = app.key();
    let receipt = app.receive(&key, dec!(3), dec!(4.00), days_ago(1)).await;

    let mut request = order_request(receipt.position_id, dec!(5));
    request.shortfall_policy = ShortfallPolicy::SynthesizeZeroCost;

    let outcome = app
        .state
        .services
        .consumption
        .consume(request)
        .await
        .expect("synthetic cover failed");

    // Shortfall units cost nothing; COGS covers only the real layers.
    assert_eq!(outcome.cogs, dec!(12.00));
    assert_eq!(outcome.quantity, dec!(5));

    let position = inventory_position::Entity::find_by_id(receipt.position_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_on_hand, Decimal::ZERO);
    assert_eq!(position.total_value, Decimal::ZERO);
}

#[tokio::test]
async fn every_drain_leaves_an_audit_row() {
    let app = TestApp::new().await;
    let key = app.key();
    let first = app.receive(&key, dec!(2), dec!(1.00), days_ago(4)).await;
    app.receive(&key, dec!(2), dec!(2.00), days_ago(2)).await;

    app.state
        .services
        .consumption
        .consume(order_request(first.position_id, dec!(3)))
        .await
        .expect("consumption failed");

    let entries = layer_audit_entry::Entity::find()
        .all(app.state.db.as_ref())
        .await
        .unwrap();
    let consume_rows: Vec<_> = entries
        .iter()
        .filter(|e| e.position_id == first.position_id && e.action == "consume")
        .collect();
    assert_eq!(consume_rows.len(), 2);
    let audited_cost: Decimal = consume_rows.iter().map(|e| e.cost_delta).sum();
    assert_eq!(audited_cost, dec!(4.00));
}
