//! Configuration loading and representation.
//!
//! Everything comes from environment variables:
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `DATABASE_URL` | none | Postgres connection string (required by [`EngineConfig::connect`]) |
//! | `CARDSTOCK_DB_MAX_CONNECTIONS` | `10` | pool size |
//! | `CARDSTOCK_LOCK_TIMEOUT_MS` | `5000` | longest wait for a stock row lock, at most `2147483647` |
//! | `CARDSTOCK_STATEMENT_TIMEOUT_MS` | `15000` | longest single statement, at most `2147483647` |
//! | `CARDSTOCK_AUDIT_ACTION` | `stock.movement` | prefix of audit `action` values |

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use crate::error::{StorageError, map_sqlx_error};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_AUDIT_ACTION: &str = "stock.movement";

/// Postgres stores `lock_timeout` and `statement_timeout` as a signed 32-bit
/// millisecond count.
pub const MAX_TIMEOUT_MS: u64 = i32::MAX as u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Movement engine and storage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub lock_timeout: Duration,
    pub statement_timeout: Duration,
    pub audit_action: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            statement_timeout: Duration::from_millis(DEFAULT_STATEMENT_TIMEOUT_MS),
            audit_action: DEFAULT_AUDIT_ACTION.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());

        let max_connections = match lookup("CARDSTOCK_DB_MAX_CONNECTIONS") {
            Some(v) => {
                let parsed = parse_positive("CARDSTOCK_DB_MAX_CONNECTIONS", &v)?;
                u32::try_from(parsed).map_err(|_| ConfigError::Invalid {
                    name: "CARDSTOCK_DB_MAX_CONNECTIONS",
                    value: v.clone(),
                    reason: format!("exceeds {}", u32::MAX),
                })?
            }
            None => defaults.max_connections,
        };

        let lock_timeout = match lookup("CARDSTOCK_LOCK_TIMEOUT_MS") {
            Some(v) => parse_timeout("CARDSTOCK_LOCK_TIMEOUT_MS", &v)?,
            None => defaults.lock_timeout,
        };

        let statement_timeout = match lookup("CARDSTOCK_STATEMENT_TIMEOUT_MS") {
            Some(v) => parse_timeout("CARDSTOCK_STATEMENT_TIMEOUT_MS", &v)?,
            None => defaults.statement_timeout,
        };

        let audit_action = match lookup("CARDSTOCK_AUDIT_ACTION") {
            Some(v) if v.trim().is_empty() => {
                return Err(ConfigError::Invalid {
                    name: "CARDSTOCK_AUDIT_ACTION",
                    value: v,
                    reason: "must not be empty".to_string(),
                });
            }
            Some(v) => v.trim().to_string(),
            None => defaults.audit_action,
        };

        Ok(Self {
            database_url,
            max_connections,
            lock_timeout,
            statement_timeout,
            audit_action,
        })
    }

    /// Open a Postgres pool with the configured size.
    pub async fn connect(&self) -> Result<PgPool, StorageError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or(StorageError::Misconfigured(ConfigError::Missing("DATABASE_URL")))?;

        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.statement_timeout)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))
    }
}

fn parse_positive(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    let parsed = value.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if parsed == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

fn parse_timeout(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let ms = parse_positive(name, value)?;
    if ms > MAX_TIMEOUT_MS {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: format!("exceeds {MAX_TIMEOUT_MS} ms"),
        });
    }
    Ok(Duration::from_millis(ms))
}
