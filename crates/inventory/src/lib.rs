//! Card stock domain module.
//!
//! This crate contains the business rules for card inventory, implemented purely
//! as deterministic domain logic (no IO, no storage, no clock reads):
//!
//! - reference data (`Bank`, `CardType`, `Location`)
//! - the stock ledger row (`Stock`, `StockKey`)
//! - movement requests and recorded movements (`MovementRequest`, `Movement`)
//! - the movement validator and its `RejectionReason`s
//! - the low-stock alert evaluator
//! - audit entries and the stock events published after a commit

pub mod alert;
pub mod audit;
pub mod event;
pub mod movement;
pub mod reference;
pub mod stock;
pub mod validation;

pub use alert::{AlertLevel, LowStockAlert, evaluate, low_stock_alerts};
pub use audit::{AttemptContext, AuditEntry, AuditStatus};
pub use event::{MovementRecorded, StockEvent};
pub use movement::{Movement, MovementKind, MovementRequest, MovementType, RawMovementRequest};
pub use reference::{Bank, CardType, Location};
pub use stock::{Stock, StockKey};
pub use validation::{LedgerSnapshot, RejectionReason, validate};
