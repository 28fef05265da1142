//! Audit trail storage.
//!
//! The engine records exactly one [`AuditEntry`] per movement attempt. Entries
//! are written outside the movement transaction, so a lost audit write never
//! undoes a committed movement; the engine logs it instead.

use std::sync::Arc;

use cardstock_inventory::AuditEntry;

use crate::error::StorageError;
use crate::ledger::{Page, Pagination};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryAuditLog;
pub use postgres::PostgresAuditLog;

/// Append-only audit log.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StorageError>;

    /// Recorded entries, newest first.
    async fn list(&self, pagination: Pagination) -> Result<Page<AuditEntry>, StorageError>;
}

#[async_trait::async_trait]
impl<S> AuditSink for Arc<S>
where
    S: AuditSink + ?Sized,
{
    async fn record(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        (**self).record(entry).await
    }

    async fn list(&self, pagination: Pagination) -> Result<Page<AuditEntry>, StorageError> {
        (**self).list(pagination).await
    }
}
