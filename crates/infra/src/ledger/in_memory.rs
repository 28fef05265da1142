//! In-memory stock ledger.
//!
//! Intended for tests/dev. Transactions are serialized by one async mutex: a
//! transaction owns the whole ledger from `begin` until it is committed or
//! dropped, so every row it reads is effectively locked. Writes are staged and
//! only copied into the ledger on commit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard};

use cardstock_core::{BankId, CardTypeId, LocationId, MovementId};
use cardstock_inventory::{Bank, CardType, Location, Movement, Stock, StockKey};

use super::{LedgerQuery, LedgerTransaction, MovementFilter, Page, Pagination, StockLedger};
use crate::error::StorageError;

#[derive(Debug, Default)]
struct LedgerState {
    banks: HashMap<BankId, Bank>,
    card_types: HashMap<CardTypeId, CardType>,
    locations: HashMap<LocationId, Location>,
    stock: BTreeMap<StockKey, Stock>,
    movements: Vec<Movement>,
    movement_ids: HashSet<MovementId>,
}

impl LedgerState {
    fn stock(&self, key: StockKey) -> Stock {
        self.stock.get(&key).cloned().unwrap_or_else(|| Stock::absent(key))
    }
}

/// In-memory ledger for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    fail_commits: Arc<AtomicBool>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_bank(&self, bank: Bank) {
        self.state.lock().await.banks.insert(bank.id, bank);
    }

    pub async fn insert_card_type(&self, card_type: CardType) {
        self.state.lock().await.card_types.insert(card_type.id, card_type);
    }

    pub async fn insert_location(&self, location: Location) {
        self.state.lock().await.locations.insert(location.id, location);
    }

    /// Set a stock row directly, bypassing the movement engine.
    pub async fn seed_stock(&self, key: StockKey, quantity: i64) -> Result<(), StorageError> {
        let stock = Stock::from_stored(key, quantity, Some(chrono::Utc::now()))?;
        self.state.lock().await.stock.insert(key, stock);
        Ok(())
    }

    /// Make every subsequent commit fail with `StorageError::Unavailable`.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of recorded movements.
    pub async fn movement_count(&self) -> usize {
        self.state.lock().await.movements.len()
    }
}

/// Transaction over [`InMemoryLedger`].
pub struct InMemoryLedgerTx {
    state: OwnedMutexGuard<LedgerState>,
    staged_stock: BTreeMap<StockKey, Stock>,
    staged_movements: Vec<Movement>,
    locked: Vec<StockKey>,
    fail_commit: bool,
}

#[async_trait::async_trait]
impl StockLedger for InMemoryLedger {
    type Tx = InMemoryLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        let state = self.state.clone().lock_owned().await;
        Ok(InMemoryLedgerTx {
            state,
            staged_stock: BTreeMap::new(),
            staged_movements: Vec::new(),
            locked: Vec::new(),
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
        })
    }
}

#[async_trait::async_trait]
impl LedgerTransaction for InMemoryLedgerTx {
    async fn card_type(&mut self, id: CardTypeId) -> Result<Option<CardType>, StorageError> {
        Ok(self.state.card_types.get(&id).cloned())
    }

    async fn location(&mut self, id: LocationId) -> Result<Option<Location>, StorageError> {
        Ok(self.state.locations.get(&id).cloned())
    }

    async fn lock_stock(&mut self, key: StockKey) -> Result<Stock, StorageError> {
        if let Some(last) = self.locked.last() {
            if *last >= key {
                return Err(StorageError::Query(format!(
                    "stock {key} locked out of order (after {last})"
                )));
            }
        }
        self.locked.push(key);
        Ok(self
            .staged_stock
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.state.stock(key)))
    }

    async fn upsert_stock(&mut self, stock: &Stock) -> Result<(), StorageError> {
        if !self.locked.contains(&stock.key) {
            return Err(StorageError::Query(format!("stock {} written without lock", stock.key)));
        }
        if stock.quantity() < 0 {
            return Err(StorageError::Corrupt(format!(
                "stock {} would become negative ({})",
                stock.key,
                stock.quantity()
            )));
        }
        self.staged_stock.insert(stock.key, stock.clone());
        Ok(())
    }

    async fn insert_movement(&mut self, movement: &Movement) -> Result<(), StorageError> {
        let duplicate = self.state.movement_ids.contains(&movement.id)
            || self.staged_movements.iter().any(|m| m.id == movement.id);
        if duplicate {
            return Err(StorageError::Query(format!("movement {} already exists", movement.id)));
        }
        self.staged_movements.push(movement.clone());
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        if self.fail_commit {
            return Err(StorageError::Unavailable("commit failed (injected)".to_string()));
        }
        let InMemoryLedgerTx {
            mut state,
            staged_stock,
            staged_movements,
            ..
        } = self;
        state.stock.extend(staged_stock);
        state.movement_ids.extend(staged_movements.iter().map(|m| m.id));
        state.movements.extend(staged_movements);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerQuery for InMemoryLedger {
    async fn card_type(&self, id: CardTypeId) -> Result<Option<CardType>, StorageError> {
        Ok(self.state.lock().await.card_types.get(&id).cloned())
    }

    async fn location(&self, id: LocationId) -> Result<Option<Location>, StorageError> {
        Ok(self.state.lock().await.locations.get(&id).cloned())
    }

    async fn stock(&self, key: StockKey) -> Result<Stock, StorageError> {
        Ok(self.state.lock().await.stock(key))
    }

    async fn stock_at_location(&self, location_id: LocationId) -> Result<Vec<Stock>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .stock
            .values()
            .filter(|s| s.key.location_id == location_id)
            .cloned()
            .collect())
    }

    async fn movements(
        &self,
        filter: &MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<Movement>, StorageError> {
        let state = self.state.lock().await;
        let mut matching: Vec<&Movement> = state.movements.iter().filter(|m| filter.matches(m)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();

        Ok(Page::new(items, total, pagination))
    }
}
