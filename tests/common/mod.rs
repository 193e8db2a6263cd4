#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use costledger::config::AppConfig;
use costledger::events;
use costledger::services::movements::{PositionKey, ReceiptCommand, ReceiptLine, ReceiptResult};
use costledger::AppState;

/// Test harness over an in-memory SQLite database with migrations applied
/// and the full service set wired.
pub struct TestApp {
    pub state: AppState,
    pub organization_id: Uuid,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        cfg.auto_migrate = true;
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let (state, event_rx) = costledger::bootstrap(cfg)
            .await
            .expect("failed to bootstrap test state");
        let event_task = tokio::spawn(events::process_events(event_rx));

        Self {
            state,
            organization_id: Uuid::new_v4(),
            _event_task: event_task,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey {
            organization_id: self.organization_id,
            product_id: Uuid::new_v4(),
            location_id: Uuid::new_v4(),
            lot_number: None,
            serial_number: None,
        }
    }

    /// Receives one plain line (no additional costs) into the given key at
    /// the given time, returning the created position and layer.
    pub async fn receive(
        &self,
        key: &PositionKey,
        quantity: Decimal,
        unit_cost: Decimal,
        received_at: DateTime<Utc>,
    ) -> ReceiptResult {
        let results = self
            .state
            .services
            .movements
            .receive_shipment(ReceiptCommand {
                lines: vec![ReceiptLine {
                    key: key.clone(),
                    quantity,
                    unit_cost,
                    weight: Decimal::ZERO,
                    category: None,
                    expiry_date: None,
                    metadata: None,
                }],
                additional_costs: Vec::new(),
                reference_id: None,
                received_at: Some(received_at),
            })
            .await
            .expect("receipt failed");
        results.into_iter().next().expect("receipt returned no line")
    }
}

/// A timestamp `days` back, so layer ages are deterministic in tests.
pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}
