use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted by the costing engine.
///
/// Every layer mutation and every reconciliation repair produces exactly one
/// event, mirroring the append-only audit trail written in the same
/// transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    LayerCreated {
        position_id: Uuid,
        layer_id: Uuid,
        quantity: Decimal,
        unit_cost: Decimal,
        reference_type: String,
    },
    LayersConsumed {
        position_id: Uuid,
        quantity: Decimal,
        cogs: Decimal,
        layers_touched: usize,
        reference_type: String,
    },
    StockAllocated {
        position_id: Uuid,
        quantity: Decimal,
    },
    StockDeallocated {
        position_id: Uuid,
        quantity: Decimal,
    },
    StockTransferred {
        source_position_id: Uuid,
        target_position_id: Uuid,
        quantity: Decimal,
        value_moved: Decimal,
    },
    SerialShipped {
        position_id: Uuid,
        serial_number: String,
    },
    DriftDetected {
        as_of: DateTime<Utc>,
        status: String,
        total_absolute_drift: Decimal,
        flagged_positions: u64,
    },
    ReconciliationApplied {
        position_id: Uuid,
        dry_run: bool,
        synthesized_layers: u64,
        revalued: bool,
        clamped_layers: u64,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Creates a channel pair sized for bursty reconcile batches.
pub fn channel(buffer: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(buffer);
    (EventSender::new(tx), rx)
}

/// Drains engine events and surfaces them through tracing.
///
/// Embedding applications that need delivery guarantees replace this task
/// with their own consumer; the engine only requires that the channel is
/// drained.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::DriftDetected {
                status,
                total_absolute_drift,
                flagged_positions,
                ..
            } if status != "green" => {
                warn!(
                    status = %status,
                    drift = %total_absolute_drift,
                    flagged = flagged_positions,
                    "finance integrity drift detected"
                );
            }
            _ => info!(event = ?event, "engine event"),
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn send_delivers_event() {
        let (sender, mut rx) = channel(4);
        sender
            .send(Event::StockAllocated {
                position_id: Uuid::new_v4(),
                quantity: dec!(3),
            })
            .await
            .expect("send should succeed");

        let received = rx.recv().await.expect("event expected");
        assert!(matches!(received, Event::StockAllocated { quantity, .. } if quantity == dec!(3)));
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (sender, rx) = channel(1);
        drop(rx);
        let result = sender
            .send(Event::StockDeallocated {
                position_id: Uuid::new_v4(),
                quantity: dec!(1),
            })
            .await;
        assert!(result.is_err());
    }
}
