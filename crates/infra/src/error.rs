//! Storage error model and SQLx error mapping.
//!
//! | SQLx Error | PostgreSQL Code | StorageError | Scenario |
//! |------------|-----------------|--------------|----------|
//! | Database | `40001` | `Conflict` | serialization failure |
//! | Database | `40P01` | `Conflict` | deadlock detected |
//! | Database | `55P03` | `Timeout` | `lock_timeout` expired |
//! | Database | `57014` | `Timeout` | `statement_timeout` expired |
//! | Database | `23514` | `Corrupt` | `quantity >= 0` check violated |
//! | Database | other | `Query` | anything else the server rejects |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Unavailable` | no usable connection |
//! | other | N/A | `Query` | decoding, protocol, ... |

use thiserror::Error;

use cardstock_core::DomainError;

use crate::config::ConfigError;

/// Failure of the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("timed out waiting for a lock or statement: {0}")]
    Timeout(String),

    /// Stored data breaks a ledger invariant. Never retryable.
    #[error("corrupt ledger data: {0}")]
    Corrupt(String),

    #[error("query failed: {0}")]
    Query(String),

    /// Settings make a connection impossible. Never retryable.
    #[error("storage misconfigured: {0}")]
    Misconfigured(#[from] ConfigError),
}

impl StorageError {
    /// Whether retrying the whole attempt can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable(_) | StorageError::Conflict(_) | StorageError::Timeout(_)
        )
    }
}

impl From<DomainError> for StorageError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvariantViolation(msg) => StorageError::Corrupt(msg),
            other => StorageError::Query(other.to_string()),
        }
    }
}

/// Map SQLx errors to StorageError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => StorageError::Conflict(msg),
                Some("55P03") | Some("57014") => StorageError::Timeout(msg),
                Some("23514") => StorageError::Corrupt(msg),
                _ => StorageError::Query(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StorageError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StorageError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(e) => StorageError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => StorageError::Unavailable(format!("tls error in {}: {}", operation, e)),
        _ => StorageError::Query(format!("sqlx error in {}: {}", operation, err)),
    }
}
