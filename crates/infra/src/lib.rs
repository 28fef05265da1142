//! Infrastructure layer: storage backends, configuration and the movement engine.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;


pub use audit::{AuditSink, InMemoryAuditLog, PostgresAuditLog};
pub use config::{ConfigError, EngineConfig};
pub use engine::{AppliedMovement, EngineError, MovementEngine, MovementOutcome};
pub use error::StorageError;
pub use ledger::{
    InMemoryLedger, LedgerQuery, LedgerTransaction, MovementFilter, Page, Pagination, PostgresLedger, StockLedger,
};
