//! Stock ledger storage boundary.
//!
//! The engine sees storage through three small traits:
//!
//! - [`StockLedger`] opens a [`LedgerTransaction`]: the only way to mutate stock.
//! - [`LedgerTransaction`] reads reference data, locks stock rows, writes stock
//!   and movements, then commits. Dropping it without `commit` rolls back.
//! - [`LedgerQuery`] offers non-locking reads for pre-checks and inspection.
//!
//! Implementations must guarantee:
//! - `lock_stock` holds the row until commit/rollback, so a decrement checked
//!   under the lock cannot race with another decrement of the same row
//! - everything written in a transaction becomes visible atomically, or not at all
//! - a stored quantity is never negative

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cardstock_core::{CardTypeId, LocationId};
use cardstock_inventory::{CardType, Location, Movement, Stock, StockKey};

use crate::error::StorageError;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryLedger;
pub use postgres::PostgresLedger;

/// Pagination parameters for ledger queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of rows to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for movement history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub card_type_id: Option<CardTypeId>,
    /// Matches either the source or the destination location.
    pub location_id: Option<LocationId>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl MovementFilter {
    pub fn matches(&self, movement: &Movement) -> bool {
        if let Some(card) = self.card_type_id {
            if movement.card_type_id != card {
                return false;
            }
        }
        if let Some(loc) = self.location_id {
            if movement.location_id != loc && movement.destination() != Some(loc) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if movement.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if movement.created_at > before {
                return false;
            }
        }
        true
    }
}

/// One page of a query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of rows matching the filter (across all pages).
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        let has_more = total > pagination.offset as u64 + items.len() as u64;
        Self {
            items,
            total,
            pagination,
            has_more,
        }
    }
}

/// Unit of work over the stock ledger.
#[async_trait::async_trait]
pub trait LedgerTransaction: Send {
    async fn card_type(&mut self, id: CardTypeId) -> Result<Option<CardType>, StorageError>;

    async fn location(&mut self, id: LocationId) -> Result<Option<Location>, StorageError>;

    /// Lock the stock row for `key` until the transaction ends and return it.
    ///
    /// An absent row is returned as [`Stock::absent`]; implementations still
    /// make sure a concurrent writer of the same key waits for this transaction.
    /// Callers lock several keys in ascending [`StockKey`] order.
    async fn lock_stock(&mut self, key: StockKey) -> Result<Stock, StorageError>;

    /// Write the absolute state of a stock row locked by this transaction.
    async fn upsert_stock(&mut self, stock: &Stock) -> Result<(), StorageError>;

    async fn insert_movement(&mut self, movement: &Movement) -> Result<(), StorageError>;

    async fn commit(self) -> Result<(), StorageError>;

    async fn rollback(self) -> Result<(), StorageError>;
}

/// Transactional access to the stock ledger.
#[async_trait::async_trait]
pub trait StockLedger: Send + Sync {
    type Tx: LedgerTransaction;

    async fn begin(&self) -> Result<Self::Tx, StorageError>;
}

/// Non-locking reads.
#[async_trait::async_trait]
pub trait LedgerQuery: Send + Sync {
    async fn card_type(&self, id: CardTypeId) -> Result<Option<CardType>, StorageError>;

    async fn location(&self, id: LocationId) -> Result<Option<Location>, StorageError>;

    /// Current stock for a key ([`Stock::absent`] when no row exists).
    async fn stock(&self, key: StockKey) -> Result<Stock, StorageError>;

    /// Every stored stock row at a location, ordered by card type.
    async fn stock_at_location(&self, location_id: LocationId) -> Result<Vec<Stock>, StorageError>;

    /// Movement history, newest first.
    async fn movements(
        &self,
        filter: &MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<Movement>, StorageError>;
}

#[async_trait::async_trait]
impl<S> StockLedger for Arc<S>
where
    S: StockLedger + ?Sized,
{
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        (**self).begin().await
    }
}

#[async_trait::async_trait]
impl<S> LedgerQuery for Arc<S>
where
    S: LedgerQuery + ?Sized,
{
    async fn card_type(&self, id: CardTypeId) -> Result<Option<CardType>, StorageError> {
        (**self).card_type(id).await
    }

    async fn location(&self, id: LocationId) -> Result<Option<Location>, StorageError> {
        (**self).location(id).await
    }

    async fn stock(&self, key: StockKey) -> Result<Stock, StorageError> {
        (**self).stock(key).await
    }

    async fn stock_at_location(&self, location_id: LocationId) -> Result<Vec<Stock>, StorageError> {
        (**self).stock_at_location(location_id).await
    }

    async fn movements(
        &self,
        filter: &MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<Movement>, StorageError> {
        (**self).movements(filter, pagination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardstock_core::{MovementId, UserId};
    use cardstock_inventory::MovementRequest;

    #[test]
    fn pagination_caps_limit() {
        assert_eq!(Pagination::new(Some(5000), None).limit, 1000);
        assert_eq!(Pagination::new(None, None), Pagination::default());
    }

    #[test]
    fn page_reports_more_rows() {
        let page = Page::new(vec![1, 2], 5, Pagination { limit: 2, offset: 0 });
        assert!(page.has_more);
        let last = Page::new(vec![5], 5, Pagination { limit: 2, offset: 4 });
        assert!(!last.has_more);
    }

    #[test]
    fn location_filter_matches_transfer_destination() {
        let card = CardTypeId::new();
        let a = LocationId::new();
        let b = LocationId::new();
        let req = MovementRequest::transfer(UserId::new(), card, a, b, 2);
        let m = Movement::from_request(MovementId::new(), &req, Utc::now());

        let by_dest = MovementFilter {
            location_id: Some(b),
            ..MovementFilter::default()
        };
        let other = MovementFilter {
            location_id: Some(LocationId::new()),
            ..MovementFilter::default()
        };

        assert!(by_dest.matches(&m));
        assert!(!other.matches(&m));
    }
}
