//! In-memory audit log for tests/dev.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use cardstock_inventory::AuditEntry;

use super::AuditSink;
use crate::error::StorageError;
use crate::ledger::{Page, Pagination};

#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditLog {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry in insertion order.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    /// Make every subsequent `record` fail with `StorageError::Unavailable`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("audit write failed (injected)".to_string()));
        }
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn list(&self, pagination: Pagination) -> Result<Page<AuditEntry>, StorageError> {
        let entries = self.entries.read().await;
        let total = entries.len() as u64;
        let items = entries
            .iter()
            .rev()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, total, pagination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardstock_core::{CardTypeId, LocationId, UserId};
    use cardstock_inventory::{AttemptContext, MovementRequest, RejectionReason};
    use chrono::Utc;

    fn denied(quantity: i64) -> AuditEntry {
        let req = MovementRequest::exit(UserId::new(), CardTypeId::new(), LocationId::new(), quantity);
        AuditEntry::rejected(
            "stock.movement",
            &req,
            &AttemptContext::default(),
            &RejectionReason::InvalidQuantity { quantity },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn list_returns_newest_first() {
        let log = InMemoryAuditLog::new();
        let first = denied(0);
        let second = denied(-1);
        log.record(&first).await.unwrap();
        log.record(&second).await.unwrap();

        let page = log.list(Pagination::default()).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items, vec![second, first]);
    }

    #[tokio::test]
    async fn injected_failure_keeps_log_unchanged() {
        let log = InMemoryAuditLog::new();
        log.fail_writes(true);
        assert!(log.record(&denied(0)).await.is_err());
        assert!(log.entries().await.is_empty());
    }
}
