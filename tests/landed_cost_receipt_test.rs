mod common;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use uuid::Uuid;

use costledger::costing::landed_cost::AllocationMethod;
use costledger::entities::{cost_component::ComponentType, inventory_position};
use costledger::errors::ServiceError;
use costledger::services::movements::{
    AdditionalCost, PositionKey, ReceiptCommand, ReceiptLine,
};

use common::{days_ago, TestApp};

fn line(key: PositionKey, quantity: Decimal, unit_cost: Decimal, weight: Decimal) -> ReceiptLine {
    ReceiptLine {
        key,
        quantity,
        unit_cost,
        weight,
        category: None,
        expiry_date: None,
        metadata: None,
    }
}

#[tokio::test]
async fn freight_is_allocated_by_value_without_losing_a_cent() {
    let app = TestApp::new().await;
    let key_a = app.key();
    let key_b = app.key();

    // Line values 100.00 and 50.00; 10.00 freight splits 6.67 / 3.33.
    let results = app
        .state
        .services
        .movements
        .receive_shipment(ReceiptCommand {
            lines: vec![
                line(key_a, dec!(10), dec!(10.00), dec!(1)),
                line(key_b, dec!(10), dec!(5.00), dec!(1)),
            ],
            additional_costs: vec![AdditionalCost {
                component_type: ComponentType::Freight,
                amount: dec!(10.00),
                method: AllocationMethod::ByValue,
            }],
            reference_id: Some(Uuid::new_v4()),
            received_at: Some(days_ago(1)),
        })
        .await
        .expect("receipt failed");

    assert_eq!(results.len(), 2);

    let mut freight_total = Decimal::ZERO;
    for result in &results {
        let components = app
            .state
            .services
            .cost_layers
            .components_for_layer(result.layer_id)
            .await
            .unwrap();
        let component_sum: Decimal = components.iter().map(|c| c.amount_total).sum();
        assert_eq!(component_sum, result.quantity * result.landed_unit_cost);

        freight_total += components
            .iter()
            .filter(|c| c.component_type == "freight")
            .map(|c| c.amount_total)
            .sum::<Decimal>();
    }
    assert_eq!(freight_total, dec!(10.00));

    // 100/150 of the freight lands on the first line: 6.67 over 10 units.
    assert_eq!(results[0].landed_unit_cost, dec!(10.667));
    assert_eq!(results[1].landed_unit_cost, dec!(5.333));
}

#[tokio::test]
async fn equal_allocation_settles_remainder_on_earliest_lines() {
    let app = TestApp::new().await;
    let keys: Vec<PositionKey> = (0..3).map(|_| app.key()).collect();

    let results = app
        .state
        .services
        .movements
        .receive_shipment(ReceiptCommand {
            lines: keys
                .iter()
                .map(|k| line(k.clone(), dec!(1), dec!(1.00), Decimal::ZERO))
                .collect(),
            additional_costs: vec![AdditionalCost {
                component_type: ComponentType::Handling,
                amount: dec!(0.10),
                method: AllocationMethod::Equal,
            }],
            reference_id: None,
            received_at: Some(days_ago(1)),
        })
        .await
        .expect("receipt failed");

    let mut handling = Vec::new();
    for result in &results {
        let components = app
            .state
            .services
            .cost_layers
            .components_for_layer(result.layer_id)
            .await
            .unwrap();
        handling.push(
            components
                .iter()
                .filter(|c| c.component_type == "handling")
                .map(|c| c.amount_total)
                .sum::<Decimal>(),
        );
    }

    // 0.10 over three lines: two get 0.03, one gets 0.04, nothing leaks.
    let total: Decimal = handling.iter().copied().sum();
    assert_eq!(total, dec!(0.10));
    assert!(handling.iter().all(|h| *h == dec!(0.03) || *h == dec!(0.04)));
}

#[tokio::test]
async fn zero_weight_basis_is_rejected() {
    let app = TestApp::new().await;
    let key = app.key();

    let err = app
        .state
        .services
        .movements
        .receive_shipment(ReceiptCommand {
            lines: vec![line(key, dec!(1), dec!(1.00), Decimal::ZERO)],
            additional_costs: vec![AdditionalCost {
                component_type: ComponentType::Freight,
                amount: dec!(5.00),
                method: AllocationMethod::ByWeight,
            }],
            reference_id: None,
            received_at: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::LandedCostAllocationConflict(_)));
}

#[tokio::test]
async fn empty_receipt_fails_validation() {
    let app = TestApp::new().await;

    let err = app
        .state
        .services
        .movements
        .receive_shipment(ReceiptCommand {
            lines: Vec::new(),
            additional_costs: Vec::new(),
            reference_id: None,
            received_at: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn receipt_updates_the_position_projection() {
    let app = TestApp::new().await;
    let key = app.key();

    let result = app.receive(&key, dec!(8), dec!(2.50), days_ago(2)).await;

    let position = inventory_position::Entity::find_by_id(result.position_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity_on_hand, dec!(8));
    assert_eq!(position.quantity_available, dec!(8));
    assert_eq!(position.unit_cost, dec!(2.50));
    assert_eq!(position.total_value, dec!(20.00));
    assert_eq!(position.version, 1);
}
