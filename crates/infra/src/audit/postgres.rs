//! Postgres-backed audit log (`audit_logs` table).
//!
//! Writes go straight to the pool in their own implicit transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use cardstock_core::{AuditLogId, UserId};
use cardstock_inventory::{AuditEntry, AuditStatus};

use super::AuditSink;
use crate::error::{StorageError, map_sqlx_error};
use crate::ledger::{Page, Pagination};

#[derive(Debug, Clone)]
pub struct PostgresAuditLog {
    pool: Arc<PgPool>,
}

impl PostgresAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait::async_trait]
impl AuditSink for PostgresAuditLog {
    #[instrument(skip(self, entry), fields(audit_id = %entry.id, status = entry.status.as_str()), err)]
    async fn record(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, user_id, action, resource, details, ip, type, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.user_id.map(Uuid::from))
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(&entry.details)
        .bind(entry.ip.as_deref())
        .bind(entry.status.as_str())
        .bind(entry.timestamp)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_audit", e))?;
        Ok(())
    }

    async fn list(&self, pagination: Pagination) -> Result<Page<AuditEntry>, StorageError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_logs")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_audit", e))?;

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, action, resource, details, ip, type, timestamp
            FROM audit_logs
            ORDER BY timestamp DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_audit", e))?;

        let items = rows.iter().map(entry_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total.max(0) as u64, pagination))
    }
}

fn entry_from_row(row: &PgRow) -> Result<AuditEntry, StorageError> {
    let get = |e| map_sqlx_error("list_audit", e);

    let id: Uuid = row.try_get("id").map_err(get)?;
    let user_id: Option<Uuid> = row.try_get("user_id").map_err(get)?;
    let status: String = row.try_get("type").map_err(get)?;
    let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(get)?;

    Ok(AuditEntry {
        id: AuditLogId::from_uuid(id),
        user_id: user_id.map(UserId::from_uuid),
        action: row.try_get("action").map_err(get)?,
        resource: row.try_get("resource").map_err(get)?,
        details: row.try_get("details").map_err(get)?,
        ip: row.try_get("ip").map_err(get)?,
        status: status.parse::<AuditStatus>().map_err(|e| StorageError::Corrupt(e.to_string()))?,
        timestamp,
    })
}
