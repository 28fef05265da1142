//! Stock events published after a movement commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cardstock_events::Event;

use crate::alert::LowStockAlert;
use crate::movement::Movement;
use crate::stock::Stock;

/// Event: MovementRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecorded {
    pub movement: Movement,
    /// Post-movement rows touched by the movement.
    pub stock: Vec<Stock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    MovementRecorded(MovementRecorded),
    LowStockDetected(LowStockAlert),
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::MovementRecorded(_) => "stock.movement.recorded",
            StockEvent::LowStockDetected(_) => "stock.alert.low_stock",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::MovementRecorded(e) => e.movement.created_at,
            StockEvent::LowStockDetected(e) => e.detected_at,
        }
    }
}
