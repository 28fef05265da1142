//! Low-stock alert evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cardstock_core::{BankId, CardTypeId, LocationId};

use crate::reference::CardType;
use crate::stock::Stock;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Normal,
    LowStock,
}

/// `LowStock` when a threshold is configured and `quantity <= threshold`.
pub fn evaluate(alert_threshold: Option<i64>, quantity: i64) -> AlertLevel {
    match alert_threshold {
        Some(threshold) if quantity <= threshold => AlertLevel::LowStock,
        _ => AlertLevel::Normal,
    }
}

/// Signal for downstream notifiers: a location is at or below its threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockAlert {
    pub bank_id: BankId,
    pub card_type_id: CardTypeId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub threshold: i64,
    pub detected_at: DateTime<Utc>,
}

/// Evaluate every touched stock row of `card_type` and collect the low ones.
///
/// Rows of other card types are ignored.
pub fn low_stock_alerts(card_type: &CardType, touched: &[Stock], detected_at: DateTime<Utc>) -> Vec<LowStockAlert> {
    let Some(threshold) = card_type.alert_threshold else {
        return Vec::new();
    };

    touched
        .iter()
        .filter(|s| s.key.card_type_id == card_type.id)
        .filter(|s| evaluate(Some(threshold), s.quantity()) == AlertLevel::LowStock)
        .map(|s| LowStockAlert {
            bank_id: card_type.bank_id,
            card_type_id: card_type.id,
            location_id: s.key.location_id,
            quantity: s.quantity(),
            threshold,
            detected_at,
        })
        .collect()
}
