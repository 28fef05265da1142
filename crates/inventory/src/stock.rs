//! Stock ledger rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cardstock_core::{CardTypeId, DomainError, DomainResult, LocationId};

use crate::validation::RejectionReason;

/// Composite key of a stock row.
///
/// Ordering is lexicographic on `(location_id, card_type_id)`; row locks are
/// always taken in ascending key order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub location_id: LocationId,
    pub card_type_id: CardTypeId,
}

impl StockKey {
    pub fn new(location_id: LocationId, card_type_id: CardTypeId) -> Self {
        Self {
            location_id,
            card_type_id,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.location_id, self.card_type_id)
    }
}

/// Current quantity of one card type at one location.
///
/// A key with no stored row is represented by [`Stock::absent`] (quantity 0,
/// never updated). Quantity is never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    pub key: StockKey,
    quantity: i64,
    last_update: Option<DateTime<Utc>>,
}

impl Stock {
    /// Stock for a key that has never been written.
    pub fn absent(key: StockKey) -> Self {
        Self {
            key,
            quantity: 0,
            last_update: None,
        }
    }

    /// Rebuild a stock row read from storage.
    ///
    /// A negative quantity can only come from a corrupted store and is reported
    /// as an invariant violation.
    pub fn from_stored(
        key: StockKey,
        quantity: i64,
        last_update: Option<DateTime<Utc>>,
    ) -> DomainResult<Self> {
        if quantity < 0 {
            return Err(DomainError::invariant(format!(
                "stock {key} has negative quantity {quantity}"
            )));
        }
        Ok(Self {
            key,
            quantity,
            last_update,
        })
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// True when the row has been written at least once.
    pub fn is_materialized(&self) -> bool {
        self.last_update.is_some()
    }

    /// Add `amount` cards.
    ///
    /// An amount the row cannot hold (`i64` overflow) is rejected like any other
    /// unusable quantity.
    pub fn credit(&self, amount: i64, now: DateTime<Utc>) -> Result<Self, RejectionReason> {
        if amount <= 0 {
            return Err(RejectionReason::InvalidQuantity { quantity: amount });
        }
        let quantity = self
            .quantity
            .checked_add(amount)
            .ok_or(RejectionReason::InvalidQuantity { quantity: amount })?;
        Ok(Self {
            key: self.key,
            quantity,
            last_update: Some(now),
        })
    }

    /// Remove `amount` cards, refusing to go below zero.
    pub fn debit(&self, amount: i64, now: DateTime<Utc>) -> Result<Self, RejectionReason> {
        if amount <= 0 {
            return Err(RejectionReason::InvalidQuantity { quantity: amount });
        }
        if self.quantity < amount {
            return Err(RejectionReason::InsufficientStock {
                requested: amount,
                available: self.quantity,
            });
        }
        Ok(Self {
            key: self.key,
            quantity: self.quantity - amount,
            last_update: Some(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StockKey {
        StockKey::new(LocationId::new(), CardTypeId::new())
    }

    #[test]
    fn absent_stock_reads_as_zero() {
        let s = Stock::absent(key());
        assert_eq!(s.quantity(), 0);
        assert!(!s.is_materialized());
    }

    #[test]
    fn credit_materializes_and_adds() {
        let now = Utc::now();
        let s = Stock::absent(key()).credit(12, now).unwrap();
        assert_eq!(s.quantity(), 12);
        assert_eq!(s.last_update(), Some(now));
    }

    #[test]
    fn debit_to_zero_is_allowed() {
        let now = Utc::now();
        let s = Stock::from_stored(key(), 5, Some(now)).unwrap();
        assert_eq!(s.debit(5, now).unwrap().quantity(), 0);
    }

    #[test]
    fn debit_below_zero_is_rejected_with_available_quantity() {
        let now = Utc::now();
        let s = Stock::from_stored(key(), 5, Some(now)).unwrap();
        assert_eq!(
            s.debit(10, now).unwrap_err(),
            RejectionReason::InsufficientStock {
                requested: 10,
                available: 5
            }
        );
    }

    #[test]
    fn negative_stored_quantity_is_an_invariant_violation() {
        let err = Stock::from_stored(key(), -1, None).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn credit_overflow_is_an_invalid_quantity() {
        let s = Stock::from_stored(key(), 1, None).unwrap();
        assert_eq!(
            s.credit(i64::MAX, Utc::now()).unwrap_err(),
            RejectionReason::InvalidQuantity { quantity: i64::MAX }
        );
    }

    #[test]
    fn keys_order_by_location_first() {
        let loc_a = LocationId::from_uuid(uuid_from(1));
        let loc_b = LocationId::from_uuid(uuid_from(2));
        let card_hi = CardTypeId::from_uuid(uuid_from(9));
        let card_lo = CardTypeId::from_uuid(uuid_from(0));
        assert!(StockKey::new(loc_a, card_hi) < StockKey::new(loc_b, card_lo));
    }

    fn uuid_from(n: u128) -> uuid::Uuid {
        uuid::Uuid::from_u128(n)
    }
}
