mod common;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use uuid::Uuid;

use costledger::costing::integrity::IntegrityStatus;
use costledger::entities::{cost_layer, integrity_snapshot, inventory_position};

use common::{days_ago, TestApp};

async fn set_cached_value(app: &TestApp, position_id: Uuid, value: Decimal) {
    let position = inventory_position::Entity::find_by_id(position_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    let mut active: inventory_position::ActiveModel = position.into();
    active.total_value = Set(value);
    active.update(app.state.db.as_ref()).await.unwrap();
}

#[tokio::test]
async fn healthy_ledger_audits_green() {
    let app = TestApp::new().await;
    let key = app.key();
    app.receive(&key, dec!(10), dec!(10.00), days_ago(1)).await;

    let summary = app
        .state
        .services
        .integrity
        .audit(None, None)
        .await
        .expect("audit failed");
    assert_eq!(summary.status, IntegrityStatus::Green);
    assert_eq!(summary.scanned_positions, 1);
    assert_eq!(summary.total_findings(), 0);
}

#[tokio::test]
async fn small_value_drift_grades_amber_and_reconcile_clears_it() {
    let app = TestApp::new().await;
    let key = app.key();
    let receipt = app.receive(&key, dec!(10), dec!(10.00), days_ago(1)).await;

    // Layers say 100.00; poison the cache to 100.02.
    set_cached_value(&app, receipt.position_id, dec!(100.02)).await;

    let summary = app
        .state
        .services
        .integrity
        .audit(None, None)
        .await
        .unwrap();
    assert_eq!(summary.status, IntegrityStatus::Amber);
    assert_eq!(summary.inventory_value_mismatch, 1);
    assert_eq!(summary.total_absolute_drift, dec!(0.02));
    assert_eq!(summary.worst_positions.len(), 1);
    assert_eq!(summary.worst_positions[0].position_id, receipt.position_id);

    // Dry run reports the repair but writes nothing.
    let dry = app
        .state
        .services
        .reconciliation
        .reconcile(true, None)
        .await
        .unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.repaired_value_drift_rows, 1);
    let position = inventory_position::Entity::find_by_id(receipt.position_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.total_value, dec!(100.02));

    let applied = app
        .state
        .services
        .reconciliation
        .reconcile(false, None)
        .await
        .unwrap();
    assert_eq!(applied.repaired_value_drift_rows, 1);
    assert_eq!(applied.remaining_mismatches, 0);
    assert_eq!(applied.post_integrity.status, IntegrityStatus::Green);

    let position = inventory_position::Entity::find_by_id(receipt.position_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.total_value, dec!(100.00));
}

#[tokio::test]
async fn drift_above_ceiling_grades_red() {
    let app = TestApp::new().await;
    let key = app.key();
    let receipt = app.receive(&key, dec!(10), dec!(10.00), days_ago(1)).await;

    // Default amber ceiling is 100.00; drift beyond it is red.
    set_cached_value(&app, receipt.position_id, dec!(250.00)).await;

    let summary = app
        .state
        .services
        .integrity
        .audit(None, None)
        .await
        .unwrap();
    assert_eq!(summary.status, IntegrityStatus::Red);
}

#[tokio::test]
async fn shared_active_serial_audits_red() {
    let app = TestApp::new().await;

    let mut key_a = app.key();
    key_a.serial_number = Some("SN-7001".to_string());
    let mut key_b = app.key();
    key_b.serial_number = Some("SN-7002".to_string());
    let a = app.receive(&key_a, dec!(1), dec!(40.00), days_ago(2)).await;
    let b = app.receive(&key_b, dec!(1), dec!(40.00), days_ago(1)).await;

    let movements = &app.state.services.movements;
    movements.allocate(a.position_id, dec!(1)).await.unwrap();
    movements.allocate(b.position_id, dec!(1)).await.unwrap();

    // Collapse the two serials into one behind the service's back; the
    // receive path would have rejected this.
    let position = inventory_position::Entity::find_by_id(b.position_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    let mut active: inventory_position::ActiveModel = position.into();
    active.serial_number = Set(Some("SN-7001".to_string()));
    active.update(app.state.db.as_ref()).await.unwrap();

    let summary = app
        .state
        .services
        .integrity
        .audit(None, None)
        .await
        .unwrap();
    assert_eq!(summary.status, IntegrityStatus::Red);
    // One finding per position holding the shared serial.
    assert_eq!(summary.duplicate_serialized_allocations, 2);
    assert_eq!(summary.scanned_positions, 2);
}

#[tokio::test]
async fn shipped_serial_without_timestamp_audits_amber() {
    let app = TestApp::new().await;

    let mut key = app.key();
    key.serial_number = Some("SN-8001".to_string());
    let receipt = app.receive(&key, dec!(1), dec!(40.00), days_ago(1)).await;

    // Status says shipped but shipped_at was never stamped.
    let position = inventory_position::Entity::find_by_id(receipt.position_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    let mut active: inventory_position::ActiveModel = position.into();
    active.status = Set("shipped".to_string());
    active.update(app.state.db.as_ref()).await.unwrap();

    let summary = app
        .state
        .services
        .integrity
        .audit(None, None)
        .await
        .unwrap();
    assert_eq!(summary.status, IntegrityStatus::Amber);
    assert_eq!(summary.shipment_link_status_mismatch, 1);
}

#[tokio::test]
async fn stock_without_layers_is_red_and_gets_a_cover_layer() {
    let app = TestApp::new().await;

    // A position claiming stock and value with no ledger behind it.
    let now = Utc::now();
    let position_id = Uuid::new_v4();
    inventory_position::ActiveModel {
        id: Set(position_id),
        organization_id: Set(app.organization_id),
        product_id: Set(Uuid::new_v4()),
        location_id: Set(Uuid::new_v4()),
        lot_number: Set(None),
        serial_number: Set(None),
        quantity_on_hand: Set(dec!(5)),
        quantity_allocated: Set(Decimal::ZERO),
        quantity_available: Set(dec!(5)),
        unit_cost: Set(dec!(4.00)),
        total_value: Set(dec!(20.00)),
        allow_negative: Set(false),
        category: Set(None),
        status: Set("available".to_string()),
        shipped_at: Set(None),
        version: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(app.state.db.as_ref())
    .await
    .unwrap();

    let summary = app
        .state
        .services
        .integrity
        .audit(None, None)
        .await
        .unwrap();
    assert_eq!(summary.status, IntegrityStatus::Amber);
    assert_eq!(summary.stock_without_active_layers, 1);

    let result = app
        .state
        .services
        .reconciliation
        .reconcile(false, None)
        .await
        .unwrap();
    assert_eq!(result.repaired_missing_layers, 1);
    assert_eq!(result.remaining_mismatches, 0);

    // The cover layer carries the cached average cost.
    let layers = app
        .state
        .services
        .cost_layers
        .layers_for_position(position_id)
        .await
        .unwrap();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].quantity_remaining, dec!(5));
    assert_eq!(layers[0].unit_cost, dec!(4.00));
    assert_eq!(layers[0].reference_type, "reconciliation");
}

#[tokio::test]
async fn overconsumed_layer_is_clamped() {
    let app = TestApp::new().await;
    let key = app.key();
    let receipt = app.receive(&key, dec!(10), dec!(2.00), days_ago(1)).await;

    let layer = cost_layer::Entity::find_by_id(receipt.layer_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    let mut active: cost_layer::ActiveModel = layer.into();
    active.quantity_remaining = Set(dec!(-3));
    active.update(app.state.db.as_ref()).await.unwrap();

    let summary = app
        .state
        .services
        .integrity
        .audit(None, None)
        .await
        .unwrap();
    assert_eq!(summary.status, IntegrityStatus::Red);
    assert_eq!(summary.negative_or_overconsumed_layers, 1);

    let result = app
        .state
        .services
        .reconciliation
        .reconcile(false, None)
        .await
        .unwrap();
    assert_eq!(result.clamped_invalid_layers, 1);

    let layer = cost_layer::Entity::find_by_id(receipt.layer_id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(layer.quantity_remaining, Decimal::ZERO);
}

#[tokio::test]
async fn snapshot_persists_the_summary() {
    let app = TestApp::new().await;
    let key = app.key();
    let receipt = app.receive(&key, dec!(10), dec!(10.00), days_ago(1)).await;
    set_cached_value(&app, receipt.position_id, dec!(101.00)).await;

    let summary = app
        .state
        .services
        .integrity
        .audit(None, None)
        .await
        .unwrap();
    let snapshot = app
        .state
        .services
        .integrity
        .persist_snapshot(&summary)
        .await
        .unwrap();

    let stored = integrity_snapshot::Entity::find_by_id(snapshot.id)
        .one(app.state.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, "amber");
    assert_eq!(stored.inventory_value_mismatch, 1);
    assert_eq!(stored.total_absolute_drift, dec!(1.00));
}

#[tokio::test]
async fn reconcile_respects_the_batch_limit() {
    let app = TestApp::new().await;

    let mut flagged = Vec::new();
    for _ in 0..3 {
        let key = app.key();
        let receipt = app.receive(&key, dec!(10), dec!(1.00), days_ago(1)).await;
        set_cached_value(&app, receipt.position_id, dec!(11.00)).await;
        flagged.push(receipt.position_id);
    }

    let result = app
        .state
        .services
        .reconciliation
        .reconcile(false, Some(2))
        .await
        .unwrap();
    assert_eq!(result.flagged_positions, 3);
    assert_eq!(result.repaired_value_drift_rows, 2);

    // The third position is still drifted and shows up on the next pass.
    let second = app
        .state
        .services
        .reconciliation
        .reconcile(false, None)
        .await
        .unwrap();
    assert_eq!(second.repaired_value_drift_rows, 1);
    assert_eq!(second.remaining_mismatches, 0);
}
