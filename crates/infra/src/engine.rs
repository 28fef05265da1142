//! Stock movement engine.
//!
//! One call to [`MovementEngine::execute`] is one movement attempt:
//!
//! 1. open a ledger transaction and read the referenced card type and locations
//! 2. lock the touched stock rows in ascending key order
//! 3. validate the request against the locked rows
//! 4. debit/credit, insert the movement, commit
//! 5. evaluate low-stock alerts on the committed rows
//! 6. write exactly one audit entry (success, denied or error)
//! 7. publish stock events
//!
//! Steps 6 and 7 happen after the transaction ended and never change the
//! outcome returned to the caller. There is no retry loop: a retryable
//! [`EngineError`] is handed back and the caller starts a new attempt.

use std::collections::BTreeMap;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use cardstock_core::MovementId;
use cardstock_events::{Event, EventBus};
use cardstock_inventory::{
    AttemptContext, AuditEntry, LedgerSnapshot, LowStockAlert, Movement, MovementRecorded, MovementRequest,
    RawMovementRequest, RejectionReason, Stock, StockEvent, StockKey, low_stock_alerts, validate,
};

use crate::audit::AuditSink;
use crate::config::{DEFAULT_AUDIT_ACTION, EngineConfig};
use crate::error::StorageError;
use crate::ledger::{LedgerQuery, LedgerTransaction, StockLedger};

/// Failure of a movement attempt that is not a business rejection.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The transaction could not complete; nothing was written.
    #[error("storage failure: {0}")]
    Storage(#[source] StorageError),

    /// The ledger holds data that should be impossible (e.g. negative stock).
    #[error("ledger invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Whether the caller may retry the whole attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Storage(e) => e.is_retryable(),
            EngineError::Invariant(_) => false,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Corrupt(msg) => EngineError::Invariant(msg),
            other => EngineError::Storage(other),
        }
    }
}

/// A committed movement and its consequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMovement {
    pub movement: Movement,
    /// Post-movement stock rows, source first.
    pub stock: Vec<Stock>,
    /// Touched rows at or below the card type's alert threshold.
    pub alerts: Vec<LowStockAlert>,
}

impl AppliedMovement {
    pub fn stock_at(&self, key: StockKey) -> Option<&Stock> {
        self.stock.iter().find(|s| s.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovementOutcome {
    Applied(AppliedMovement),
    Rejected(RejectionReason),
}

impl MovementOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MovementOutcome::Applied(_))
    }

    pub fn applied(&self) -> Option<&AppliedMovement> {
        match self {
            MovementOutcome::Applied(a) => Some(a),
            MovementOutcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            MovementOutcome::Applied(_) => None,
            MovementOutcome::Rejected(r) => Some(r),
        }
    }
}

/// Validates and applies stock movements against an injected ledger.
pub struct MovementEngine<L, A, B> {
    ledger: L,
    audit: A,
    bus: B,
    audit_action: String,
}

impl<L, A, B> MovementEngine<L, A, B>
where
    L: StockLedger + LedgerQuery,
    A: AuditSink,
    B: EventBus<StockEvent>,
{
    pub fn new(ledger: L, audit: A, bus: B) -> Self {
        Self {
            ledger,
            audit,
            bus,
            audit_action: DEFAULT_AUDIT_ACTION.to_string(),
        }
    }

    pub fn from_config(ledger: L, audit: A, bus: B, config: &EngineConfig) -> Self {
        Self::new(ledger, audit, bus).with_audit_action(config.audit_action.clone())
    }

    /// Prefix of the audit `action` column (`<prefix>.exit`, ...).
    pub fn with_audit_action(mut self, action: impl Into<String>) -> Self {
        self.audit_action = action.into();
        self
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn audit_log(&self) -> &A {
        &self.audit
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Run one movement attempt.
    ///
    /// Business rejections come back as `Ok(MovementOutcome::Rejected)`; only
    /// storage failures and invariant violations are errors. Either way the
    /// attempt is audited once.
    #[instrument(
        skip(self, request, ctx),
        fields(
            kind = %request.kind.movement_type(),
            quantity = request.quantity,
            card_type_id = %request.card_type_id,
            location_id = %request.location_id,
            dest_location_id = ?request.kind.destination(),
        ),
        err
    )]
    pub async fn execute(
        &self,
        request: &MovementRequest,
        ctx: &AttemptContext,
    ) -> Result<MovementOutcome, EngineError> {
        let result = self.apply(request).await;

        let now = Utc::now();
        let entry = match &result {
            Ok(MovementOutcome::Applied(applied)) => {
                AuditEntry::applied(&self.audit_action, request, ctx, &applied.movement, &applied.stock, now)
            }
            Ok(MovementOutcome::Rejected(reason)) => {
                info!(reason = reason.code(), %reason, "movement rejected");
                AuditEntry::rejected(&self.audit_action, request, ctx, reason, now)
            }
            Err(err @ EngineError::Invariant(_)) => {
                error!(error = %err, "movement aborted on ledger invariant violation");
                AuditEntry::failed(&self.audit_action, request, ctx, &err.to_string(), now)
            }
            Err(err @ EngineError::Storage(_)) => {
                warn!(error = %err, retryable = err.is_retryable(), "movement aborted on storage failure");
                AuditEntry::failed(&self.audit_action, request, ctx, &err.to_string(), now)
            }
        };

        if let Err(e) = self.audit.record(&entry).await {
            error!(audit_id = %entry.id, status = entry.status.as_str(), error = %e, "failed to record audit entry");
        }

        if let Ok(MovementOutcome::Applied(applied)) = &result {
            self.publish(applied);
        }

        result
    }

    /// Run one movement attempt from flat request fields.
    ///
    /// Fields that do not form a valid request are rejected and audited as
    /// denied without touching the ledger. See [`RawMovementRequest::parse`].
    pub async fn execute_raw(
        &self,
        request: &RawMovementRequest,
        ctx: &AttemptContext,
    ) -> Result<MovementOutcome, EngineError> {
        let reason = match request.parse() {
            Ok(parsed) => return self.execute(&parsed, ctx).await,
            Err(reason) => reason,
        };

        info!(
            kind = %request.movement_type,
            quantity = request.quantity,
            reason = reason.code(),
            %reason,
            "malformed movement request rejected"
        );
        let entry = AuditEntry::rejected_raw(&self.audit_action, request, ctx, &reason, Utc::now());
        if let Err(e) = self.audit.record(&entry).await {
            error!(audit_id = %entry.id, status = entry.status.as_str(), error = %e, "failed to record audit entry");
        }

        Ok(MovementOutcome::Rejected(reason))
    }

    /// Validate `request` against current ledger state without locking,
    /// writing or auditing anything.
    ///
    /// Returns the rejection the request would get right now, if any. The
    /// verdict is advisory: stock may change before `execute` runs.
    pub async fn precheck(&self, request: &MovementRequest) -> Result<Option<RejectionReason>, EngineError> {
        let card_type = self.ledger.card_type(request.card_type_id).await?;
        let source = self.ledger.location(request.location_id).await?;
        let destination = match request.kind.destination() {
            Some(id) => self.ledger.location(id).await?,
            None => None,
        };
        let available = self.ledger.stock(request.source_key()).await?.quantity();

        let snapshot = LedgerSnapshot {
            card_type,
            source,
            destination,
            available,
        };
        Ok(validate(request, &snapshot).err())
    }

    async fn apply(&self, request: &MovementRequest) -> Result<MovementOutcome, EngineError> {
        let mut tx = self.ledger.begin().await?;

        let card_type = tx.card_type(request.card_type_id).await?;
        let source = tx.location(request.location_id).await?;
        let destination = match request.kind.destination() {
            Some(id) => tx.location(id).await?,
            None => None,
        };

        // Rows are only locked (and possibly created) once every reference exists.
        let references_exist =
            card_type.is_some() && source.is_some() && (request.kind.destination().is_none() || destination.is_some());

        let mut locked: BTreeMap<StockKey, Stock> = BTreeMap::new();
        if references_exist {
            for key in request.touched_keys() {
                let stock = tx.lock_stock(key).await?;
                locked.insert(key, stock);
            }
        }

        let source_key = request.source_key();
        let source_stock = locked
            .get(&source_key)
            .cloned()
            .unwrap_or_else(|| Stock::absent(source_key));

        let snapshot = LedgerSnapshot {
            card_type,
            source,
            destination,
            available: source_stock.quantity(),
        };
        if let Err(reason) = validate(request, &snapshot) {
            rollback(tx).await;
            return Ok(MovementOutcome::Rejected(reason));
        }
        let Some(card_type) = snapshot.card_type else {
            return Err(EngineError::Invariant(format!(
                "card type {} vanished after validation",
                request.card_type_id
            )));
        };

        let now = Utc::now();
        let mut touched = Vec::with_capacity(2);

        let source_after = if request.kind.debits_source() {
            source_stock.debit(request.quantity, now)
        } else {
            source_stock.credit(request.quantity, now)
        };
        let source_after = match source_after {
            Ok(stock) => stock,
            Err(reason) => {
                rollback(tx).await;
                return Ok(MovementOutcome::Rejected(reason));
            }
        };
        tx.upsert_stock(&source_after).await?;
        touched.push(source_after);

        if let Some(dest_key) = request.destination_key() {
            let dest_stock = locked.get(&dest_key).cloned().unwrap_or_else(|| Stock::absent(dest_key));
            let dest_after = match dest_stock.credit(request.quantity, now) {
                Ok(stock) => stock,
                Err(reason) => {
                    rollback(tx).await;
                    return Ok(MovementOutcome::Rejected(reason));
                }
            };
            tx.upsert_stock(&dest_after).await?;
            touched.push(dest_after);
        }

        let movement = Movement::from_request(MovementId::new(), request, now);
        tx.insert_movement(&movement).await?;
        tx.commit().await?;

        let alerts = low_stock_alerts(&card_type, &touched, now);

        Ok(MovementOutcome::Applied(AppliedMovement {
            movement,
            stock: touched,
            alerts,
        }))
    }

    fn publish(&self, applied: &AppliedMovement) {
        for alert in &applied.alerts {
            warn!(
                location_id = %alert.location_id,
                card_type_id = %alert.card_type_id,
                quantity = alert.quantity,
                threshold = alert.threshold,
                "stock at or below alert threshold"
            );
        }

        let recorded = StockEvent::MovementRecorded(MovementRecorded {
            movement: applied.movement.clone(),
            stock: applied.stock.clone(),
        });
        let alerts = applied.alerts.iter().cloned().map(StockEvent::LowStockDetected);

        for event in std::iter::once(recorded).chain(alerts) {
            let event_type = event.event_type();
            match self.bus.publish(event) {
                Ok(delivered) => debug!(event_type, delivered, "stock event published"),
                Err(e) => warn!(event_type, error = %e, "failed to publish stock event"),
            }
        }
    }
}

async fn rollback<T: LedgerTransaction>(tx: T) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "rollback of rejected movement failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;

    use cardstock_core::{BankId, CardTypeId, LocationId, UserId};
    use cardstock_events::InMemoryEventBus;
    use cardstock_inventory::{AuditStatus, Bank, CardType, Location, MovementType};

    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::ledger::{InMemoryLedger, MovementFilter, Pagination};

    type TestEngine = MovementEngine<InMemoryLedger, InMemoryAuditLog, Arc<InMemoryEventBus<StockEvent>>>;

    struct Harness {
        engine: TestEngine,
        ledger: InMemoryLedger,
        audit: InMemoryAuditLog,
        bus: Arc<InMemoryEventBus<StockEvent>>,
        card: CardType,
        loc_a: Location,
        loc_b: Location,
        user: UserId,
    }

    impl Harness {
        async fn new(threshold: Option<i64>) -> Self {
            let bank = Bank {
                id: BankId::new(),
                name: "First Card Bank".to_string(),
            };
            let card = CardType {
                id: CardTypeId::new(),
                bank_id: bank.id,
                name: "Visa Gold".to_string(),
                alert_threshold: threshold,
            };
            let loc_a = Location {
                id: LocationId::new(),
                bank_id: bank.id,
                name: "Head office vault".to_string(),
            };
            let loc_b = Location {
                id: LocationId::new(),
                bank_id: bank.id,
                name: "Airport branch".to_string(),
            };

            let ledger = InMemoryLedger::new();
            ledger.insert_bank(bank).await;
            ledger.insert_card_type(card.clone()).await;
            ledger.insert_location(loc_a.clone()).await;
            ledger.insert_location(loc_b.clone()).await;

            let audit = InMemoryAuditLog::new();
            let bus = Arc::new(InMemoryEventBus::new());
            let engine = MovementEngine::new(ledger.clone(), audit.clone(), bus.clone());

            Self {
                engine,
                ledger,
                audit,
                bus,
                card,
                loc_a,
                loc_b,
                user: UserId::new(),
            }
        }

        fn key_a(&self) -> StockKey {
            StockKey::new(self.loc_a.id, self.card.id)
        }

        fn key_b(&self) -> StockKey {
            StockKey::new(self.loc_b.id, self.card.id)
        }

        async fn qty(&self, key: StockKey) -> i64 {
            self.ledger.stock(key).await.unwrap().quantity()
        }

        fn exit(&self, quantity: i64) -> MovementRequest {
            MovementRequest::exit(self.user, self.card.id, self.loc_a.id, quantity)
        }

        fn transfer(&self, quantity: i64) -> MovementRequest {
            MovementRequest::transfer(self.user, self.card.id, self.loc_a.id, self.loc_b.id, quantity)
        }

        async fn run(&self, request: &MovementRequest) -> MovementOutcome {
            self.engine.execute(request, &AttemptContext::default()).await.unwrap()
        }
    }

    #[tokio::test]
    async fn exit_within_stock_is_applied() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();

        let outcome = h.run(&h.exit(5)).await;

        let applied = outcome.applied().unwrap();
        assert_eq!(applied.movement.movement_type(), MovementType::Exit);
        assert_eq!(applied.movement.quantity, 5);
        assert_eq!(applied.stock_at(h.key_a()).unwrap().quantity(), 5);
        assert_eq!(h.qty(h.key_a()).await, 5);
        assert_eq!(h.ledger.movement_count().await, 1);

        let audit = h.audit.entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, AuditStatus::Success);
        assert_eq!(audit[0].action, "stock.movement.exit");
    }

    #[tokio::test]
    async fn exit_beyond_stock_is_denied_and_audited() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 5).await.unwrap();

        let outcome = h.run(&h.exit(10)).await;

        assert_eq!(
            outcome.rejection(),
            Some(&RejectionReason::InsufficientStock {
                requested: 10,
                available: 5
            })
        );
        assert_eq!(h.qty(h.key_a()).await, 5);
        assert_eq!(h.ledger.movement_count().await, 0);

        let audit = h.audit.entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, AuditStatus::Denied);
    }

    #[tokio::test]
    async fn transfer_moves_stock_between_locations() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();
        h.ledger.seed_stock(h.key_b(), 0).await.unwrap();

        let outcome = h.run(&h.transfer(4)).await;

        let applied = outcome.applied().unwrap();
        assert_eq!(applied.movement.destination(), Some(h.loc_b.id));
        assert_eq!(h.qty(h.key_a()).await, 6);
        assert_eq!(h.qty(h.key_b()).await, 4);
        assert_eq!(applied.stock.len(), 2);
        assert_eq!(applied.stock[0].key, h.key_a());
    }

    #[tokio::test]
    async fn transfer_creates_missing_destination_row() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 3).await.unwrap();
        assert!(!h.ledger.stock(h.key_b()).await.unwrap().is_materialized());

        h.run(&h.transfer(3)).await;

        let dest = h.ledger.stock(h.key_b()).await.unwrap();
        assert!(dest.is_materialized());
        assert_eq!(dest.quantity(), 3);
        assert_eq!(h.qty(h.key_a()).await, 0);
    }

    #[tokio::test]
    async fn entry_creates_stock_row() {
        let h = Harness::new(None).await;
        let req = MovementRequest::entry(h.user, h.card.id, h.loc_a.id, 25);

        assert!(h.run(&req).await.is_applied());
        assert_eq!(h.qty(h.key_a()).await, 25);
    }

    #[tokio::test]
    async fn exit_to_threshold_raises_low_stock_alert() {
        let h = Harness::new(Some(3)).await;
        h.ledger.seed_stock(h.key_a(), 5).await.unwrap();
        let events = h.bus.subscribe();

        let outcome = h.run(&h.exit(3)).await;

        let applied = outcome.applied().unwrap();
        assert_eq!(applied.alerts.len(), 1);
        assert_eq!(applied.alerts[0].location_id, h.loc_a.id);
        assert_eq!(applied.alerts[0].quantity, 2);
        assert_eq!(applied.alerts[0].threshold, 3);

        let published = events.drain();
        assert_eq!(published.len(), 2);
        assert!(matches!(published[0], StockEvent::MovementRecorded(_)));
        assert!(matches!(&published[1], StockEvent::LowStockDetected(a) if a.quantity == 2));
    }

    #[tokio::test]
    async fn rejected_attempts_publish_nothing() {
        let h = Harness::new(Some(3)).await;
        let events = h.bus.subscribe();

        h.run(&h.exit(1)).await;

        assert!(events.drain().is_empty());
        assert_eq!(h.bus.published_count(), 0);
    }

    #[tokio::test]
    async fn alert_subscribers_only_see_low_stock_events() {
        let h = Harness::new(Some(3)).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();
        let alerts = h.bus.subscribe();

        h.run(&h.exit(2)).await;
        h.run(&h.exit(6)).await;

        let low = alerts.drain_of_type("stock.alert.low_stock");
        assert_eq!(low.len(), 1);
        assert!(matches!(&low[0], StockEvent::LowStockDetected(a) if a.quantity == 2));
        assert_eq!(h.bus.published_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_exits_never_overdraw() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();

        let engine = Arc::new(h.engine);
        let req = MovementRequest::exit(h.user, h.card.id, h.loc_a.id, 6);

        let first = {
            let engine = Arc::clone(&engine);
            let req = req.clone();
            tokio::spawn(async move { engine.execute(&req, &AttemptContext::default()).await })
        };
        let second = {
            let engine = Arc::clone(&engine);
            let req = req.clone();
            tokio::spawn(async move { engine.execute(&req, &AttemptContext::default()).await })
        };

        let outcomes = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];

        assert_eq!(outcomes.iter().filter(|o| o.is_applied()).count(), 1);
        let rejected: Vec<_> = outcomes.iter().filter_map(|o| o.rejection()).collect();
        assert_eq!(
            rejected,
            vec![&RejectionReason::InsufficientStock {
                requested: 6,
                available: 4
            }]
        );
        assert_eq!(h.ledger.stock(StockKey::new(h.loc_a.id, h.card.id)).await.unwrap().quantity(), 4);
        assert_eq!(h.audit.entries().await.len(), 2);
    }

    #[tokio::test]
    async fn rejected_transfer_changes_nothing() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 2).await.unwrap();
        h.ledger.seed_stock(h.key_b(), 1).await.unwrap();

        let outcome = h.run(&h.transfer(5)).await;

        assert_eq!(outcome.rejection().map(|r| r.code()), Some("insufficient_stock"));
        assert_eq!(h.qty(h.key_a()).await, 2);
        assert_eq!(h.qty(h.key_b()).await, 1);
        assert_eq!(h.ledger.movement_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_card_type_is_invalid_reference() {
        let h = Harness::new(None).await;
        let req = MovementRequest::entry(h.user, CardTypeId::new(), h.loc_a.id, 1);

        let outcome = h.run(&req).await;

        assert_eq!(outcome.rejection().map(|r| r.code()), Some("invalid_reference"));
        assert_eq!(h.ledger.movement_count().await, 0);
        assert_eq!(h.audit.entries().await[0].status, AuditStatus::Denied);
    }

    #[tokio::test]
    async fn cross_bank_destination_is_invalid_reference() {
        let h = Harness::new(None).await;
        let foreign = Location {
            id: LocationId::new(),
            bank_id: BankId::new(),
            name: "Other bank branch".to_string(),
        };
        h.ledger.insert_location(foreign.clone()).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();

        let req = MovementRequest::transfer(h.user, h.card.id, h.loc_a.id, foreign.id, 1);
        let outcome = h.run(&req).await;

        assert_eq!(outcome.rejection().map(|r| r.code()), Some("invalid_reference"));
        assert_eq!(h.qty(h.key_a()).await, 10);
    }

    #[tokio::test]
    async fn transfer_to_same_location_is_invalid_destination() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();
        let req = MovementRequest::transfer(h.user, h.card.id, h.loc_a.id, h.loc_a.id, 1);

        let outcome = h.run(&req).await;

        assert_eq!(outcome.rejection().map(|r| r.code()), Some("invalid_destination"));
        assert_eq!(h.qty(h.key_a()).await, 10);
    }

    #[tokio::test]
    async fn transfer_without_destination_is_denied_once() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();
        let events = h.bus.subscribe();
        let raw = RawMovementRequest {
            movement_type: MovementType::Transfer,
            quantity: 3,
            user_id: h.user,
            card_type_id: h.card.id,
            location_id: h.loc_a.id,
            dest_location_id: None,
        };

        let outcome = h.engine.execute_raw(&raw, &AttemptContext::default()).await.unwrap();

        assert_eq!(outcome.rejection().map(|r| r.code()), Some("invalid_destination"));
        assert_eq!(h.qty(h.key_a()).await, 10);
        assert_eq!(h.ledger.movement_count().await, 0);
        assert!(events.drain().is_empty());

        let audit = h.audit.entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, AuditStatus::Denied);
        assert_eq!(audit[0].user_id, Some(h.user));
        assert_eq!(audit[0].action, "stock.movement.transfer");
    }

    #[tokio::test]
    async fn well_formed_raw_request_is_applied() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();
        let raw = RawMovementRequest {
            movement_type: MovementType::Transfer,
            quantity: 3,
            user_id: h.user,
            card_type_id: h.card.id,
            location_id: h.loc_a.id,
            dest_location_id: Some(h.loc_b.id),
        };

        let outcome = h.engine.execute_raw(&raw, &AttemptContext::default()).await.unwrap();

        assert!(outcome.is_applied());
        assert_eq!(h.qty(h.key_a()).await, 7);
        assert_eq!(h.qty(h.key_b()).await, 3);
        assert_eq!(h.audit.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn entry_overflowing_stock_is_denied() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 1).await.unwrap();
        let req = MovementRequest::entry(h.user, h.card.id, h.loc_a.id, i64::MAX);

        let outcome = h.run(&req).await;

        assert_eq!(
            outcome.rejection(),
            Some(&RejectionReason::InvalidQuantity { quantity: i64::MAX })
        );
        assert_eq!(h.qty(h.key_a()).await, 1);
        assert_eq!(h.ledger.movement_count().await, 0);

        let audit = h.audit.entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, AuditStatus::Denied);
    }

    #[tokio::test]
    async fn transfer_overflowing_destination_changes_nothing() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();
        h.ledger.seed_stock(h.key_b(), i64::MAX - 2).await.unwrap();

        let outcome = h.run(&h.transfer(5)).await;

        assert_eq!(outcome.rejection().map(|r| r.code()), Some("invalid_quantity"));
        assert_eq!(h.qty(h.key_a()).await, 10);
        assert_eq!(h.qty(h.key_b()).await, i64::MAX - 2);
        assert_eq!(h.ledger.movement_count().await, 0);
        assert_eq!(h.audit.entries().await[0].status, AuditStatus::Denied);
    }

    #[tokio::test]
    async fn commit_failure_is_retryable_and_audited_as_error() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();
        h.ledger.fail_commits(true);

        let err = h
            .engine
            .execute(&h.exit(5), &AttemptContext::with_ip("192.0.2.10"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Storage(StorageError::Unavailable(_))));
        assert!(err.is_retryable());
        assert_eq!(h.qty(h.key_a()).await, 10);
        assert_eq!(h.ledger.movement_count().await, 0);

        let audit = h.audit.entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, AuditStatus::Error);
        assert_eq!(audit[0].ip.as_deref(), Some("192.0.2.10"));
    }

    #[tokio::test]
    async fn audit_failure_keeps_committed_movement() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();
        h.audit.fail_writes(true);

        let outcome = h.run(&h.exit(4)).await;

        assert!(outcome.is_applied());
        assert_eq!(h.qty(h.key_a()).await, 6);
        assert!(h.audit.entries().await.is_empty());
    }

    #[tokio::test]
    async fn precheck_has_no_side_effects() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 5).await.unwrap();

        assert_eq!(h.engine.precheck(&h.exit(5)).await.unwrap(), None);
        assert_eq!(
            h.engine.precheck(&h.exit(6)).await.unwrap().map(|r| r.code()),
            Some("insufficient_stock")
        );
        assert_eq!(h.qty(h.key_a()).await, 5);
        assert!(h.audit.entries().await.is_empty());
    }

    #[tokio::test]
    async fn configured_audit_action_prefixes_entries() {
        let h = Harness::new(None).await;
        let config = EngineConfig {
            audit_action: "cards".to_string(),
            ..EngineConfig::default()
        };
        let engine = MovementEngine::from_config(h.ledger.clone(), h.audit.clone(), h.bus.clone(), &config);

        let req = MovementRequest::entry(h.user, h.card.id, h.loc_a.id, 1);
        engine.execute(&req, &AttemptContext::default()).await.unwrap();

        assert_eq!(h.audit.entries().await[0].action, "cards.entry");
    }

    #[tokio::test]
    async fn history_lists_applied_movements_only() {
        let h = Harness::new(None).await;
        h.ledger.seed_stock(h.key_a(), 10).await.unwrap();

        h.run(&h.transfer(4)).await;
        h.run(&h.exit(50)).await;

        let filter = MovementFilter {
            location_id: Some(h.loc_b.id),
            ..MovementFilter::default()
        };
        let page = h.ledger.movements(&filter, Pagination::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].movement_type(), MovementType::Transfer);
    }

    #[test]
    fn corrupt_storage_is_an_invariant_violation() {
        let err = EngineError::from(StorageError::Corrupt("stock x/y is -1".to_string()));
        assert!(matches!(err, EngineError::Invariant(_)));
        assert!(!err.is_retryable());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Entry(i64),
        ExitA(i64),
        ExitB(i64),
        TransferAb(i64),
        TransferBa(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (-2i64..20).prop_map(Op::Entry),
            (-2i64..20).prop_map(Op::ExitA),
            (-2i64..20).prop_map(Op::ExitB),
            (-2i64..20).prop_map(Op::TransferAb),
            (-2i64..20).prop_map(Op::TransferBa),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: stock never goes negative, transfers conserve the total,
        /// and every attempt leaves exactly one audit entry.
        #[test]
        fn movement_sequences_preserve_ledger_invariants(
            initial_a in 0i64..30,
            initial_b in 0i64..30,
            ops in prop::collection::vec(op(), 1..25),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let h = Harness::new(None).await;
                h.ledger.seed_stock(h.key_a(), initial_a).await.unwrap();
                h.ledger.seed_stock(h.key_b(), initial_b).await.unwrap();

                let mut expected_total = initial_a + initial_b;

                for op in &ops {
                    let (a, b) = (h.qty(h.key_a()).await, h.qty(h.key_b()).await);
                    let req = match *op {
                        Op::Entry(q) => MovementRequest::entry(h.user, h.card.id, h.loc_a.id, q),
                        Op::ExitA(q) => h.exit(q),
                        Op::ExitB(q) => MovementRequest::exit(h.user, h.card.id, h.loc_b.id, q),
                        Op::TransferAb(q) => h.transfer(q),
                        Op::TransferBa(q) => {
                            MovementRequest::transfer(h.user, h.card.id, h.loc_b.id, h.loc_a.id, q)
                        }
                    };

                    let outcome = h.run(&req).await;
                    let (a2, b2) = (h.qty(h.key_a()).await, h.qty(h.key_b()).await);

                    prop_assert!(a2 >= 0 && b2 >= 0);
                    match (op, outcome.is_applied()) {
                        (Op::Entry(q), true) => expected_total += q,
                        (Op::ExitA(q) | Op::ExitB(q), true) => expected_total -= q,
                        (Op::TransferAb(q), true) => {
                            prop_assert_eq!((a2, b2), (a - q, b + q));
                        }
                        (Op::TransferBa(q), true) => {
                            prop_assert_eq!((a2, b2), (a + q, b - q));
                        }
                        (_, false) => {
                            prop_assert_eq!((a2, b2), (a, b));
                        }
                    }
                    prop_assert_eq!(a2 + b2, expected_total);
                }

                prop_assert_eq!(h.audit.entries().await.len(), ops.len());
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
