//! Postgres-backed stock ledger.
//!
//! ## Locking
//!
//! `lock_stock` first inserts a zero row for the key (`ON CONFLICT DO NOTHING`)
//! and then reads it back with `SELECT ... FOR UPDATE`. The insert makes sure
//! there is always a row to lock, so two transactions creating the same key
//! serialize on the primary key instead of both seeing "absent". A zero row
//! created by a transaction that later rolls back disappears with it.
//!
//! Every transaction sets `lock_timeout` and `statement_timeout` locally, so a
//! stuck lock surfaces as [`StorageError::Timeout`] instead of hanging.
//!
//! ## Error Mapping
//!
//! See [`crate::error`]; the `quantity >= 0` check constraint maps to
//! [`StorageError::Corrupt`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgExecutor, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use cardstock_core::{BankId, CardTypeId, LocationId, MovementId, UserId};
use cardstock_inventory::{Bank, CardType, Location, Movement, MovementType, Stock, StockKey};

use super::{LedgerQuery, LedgerTransaction, MovementFilter, Page, Pagination, StockLedger};
use crate::config::EngineConfig;
use crate::error::{StorageError, map_sqlx_error};

/// Schema applied by [`PostgresLedger::migrate`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_card_stock.sql");

/// Postgres stock ledger.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
    statement_timeout: Duration,
}

impl PostgresLedger {
    /// Create a ledger with the default timeouts.
    pub fn new(pool: PgPool) -> Self {
        let defaults = EngineConfig::default();
        Self::with_timeouts(pool, defaults.lock_timeout, defaults.statement_timeout)
    }

    pub fn with_timeouts(pool: PgPool, lock_timeout: Duration, statement_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout,
            statement_timeout,
        }
    }

    pub fn from_config(pool: PgPool, config: &EngineConfig) -> Self {
        Self::with_timeouts(pool, config.lock_timeout, config.statement_timeout)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self, bank), fields(bank_id = %bank.id), err)]
    pub async fn upsert_bank(&self, bank: &Bank) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO banks (id, name) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(bank.id.as_uuid())
        .bind(&bank.name)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_bank", e))?;
        Ok(())
    }

    #[instrument(skip(self, card_type), fields(card_type_id = %card_type.id), err)]
    pub async fn upsert_card_type(&self, card_type: &CardType) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO card_types (id, bank_id, name, alert_threshold) VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
                SET bank_id = EXCLUDED.bank_id,
                    name = EXCLUDED.name,
                    alert_threshold = EXCLUDED.alert_threshold
            "#,
        )
        .bind(card_type.id.as_uuid())
        .bind(card_type.bank_id.as_uuid())
        .bind(&card_type.name)
        .bind(card_type.alert_threshold)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_card_type", e))?;
        Ok(())
    }

    #[instrument(skip(self, location), fields(location_id = %location.id), err)]
    pub async fn upsert_location(&self, location: &Location) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO locations (id, bank_id, name) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET bank_id = EXCLUDED.bank_id, name = EXCLUDED.name
            "#,
        )
        .bind(location.id.as_uuid())
        .bind(location.bank_id.as_uuid())
        .bind(&location.name)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_location", e))?;
        Ok(())
    }

    /// Set a stock row directly, bypassing the movement engine.
    #[instrument(skip(self), fields(stock = %key), err)]
    pub async fn seed_stock(&self, key: StockKey, quantity: i64) -> Result<(), StorageError> {
        let stock = Stock::from_stored(key, quantity, Some(Utc::now()))?;
        write_stock(&*self.pool, &stock, "seed_stock").await
    }
}

/// Transaction over [`PostgresLedger`]. Dropping it rolls back.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl StockLedger for PostgresLedger {
    type Tx = PgLedgerTx;

    #[instrument(skip(self), fields(operation = tracing::field::Empty), err)]
    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        Span::current().record("operation", "begin");

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true), set_config('statement_timeout', $2, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .bind(format!("{}ms", self.statement_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        Ok(PgLedgerTx { tx })
    }
}

#[async_trait::async_trait]
impl LedgerTransaction for PgLedgerTx {
    async fn card_type(&mut self, id: CardTypeId) -> Result<Option<CardType>, StorageError> {
        fetch_card_type(&mut *self.tx, id).await
    }

    async fn location(&mut self, id: LocationId) -> Result<Option<Location>, StorageError> {
        fetch_location(&mut *self.tx, id).await
    }

    #[instrument(skip(self), fields(stock = %key), err)]
    async fn lock_stock(&mut self, key: StockKey) -> Result<Stock, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO stock (location_id, card_type_id, quantity, last_update)
            VALUES ($1, $2, 0, NULL)
            ON CONFLICT (location_id, card_type_id) DO NOTHING
            "#,
        )
        .bind(key.location_id.as_uuid())
        .bind(key.card_type_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stock", e))?;

        let row = sqlx::query(
            r#"
            SELECT quantity, last_update
            FROM stock
            WHERE location_id = $1 AND card_type_id = $2
            FOR UPDATE
            "#,
        )
        .bind(key.location_id.as_uuid())
        .bind(key.card_type_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stock", e))?;

        let quantity: i64 = row.try_get("quantity").map_err(|e| map_sqlx_error("lock_stock", e))?;
        let last_update: Option<DateTime<Utc>> =
            row.try_get("last_update").map_err(|e| map_sqlx_error("lock_stock", e))?;

        Ok(Stock::from_stored(key, quantity, last_update)?)
    }

    async fn upsert_stock(&mut self, stock: &Stock) -> Result<(), StorageError> {
        write_stock(&mut *self.tx, stock, "upsert_stock").await
    }

    #[instrument(skip(self, movement), fields(movement_id = %movement.id), err)]
    async fn insert_movement(&mut self, movement: &Movement) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO movements (
                id, type, quantity, user_id, card_type_id, location_id, dest_location_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(movement.id.as_uuid())
        .bind(movement.movement_type().as_str())
        .bind(movement.quantity)
        .bind(movement.user_id.as_uuid())
        .bind(movement.card_type_id.as_uuid())
        .bind(movement.location_id.as_uuid())
        .bind(movement.destination().map(Uuid::from))
        .bind(movement.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_movement", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait::async_trait]
impl LedgerQuery for PostgresLedger {
    async fn card_type(&self, id: CardTypeId) -> Result<Option<CardType>, StorageError> {
        fetch_card_type(&*self.pool, id).await
    }

    async fn location(&self, id: LocationId) -> Result<Option<Location>, StorageError> {
        fetch_location(&*self.pool, id).await
    }

    async fn stock(&self, key: StockKey) -> Result<Stock, StorageError> {
        let row = sqlx::query(
            "SELECT quantity, last_update FROM stock WHERE location_id = $1 AND card_type_id = $2",
        )
        .bind(key.location_id.as_uuid())
        .bind(key.card_type_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stock", e))?;

        match row {
            Some(row) => {
                let quantity: i64 = row.try_get("quantity").map_err(|e| map_sqlx_error("stock", e))?;
                let last_update: Option<DateTime<Utc>> =
                    row.try_get("last_update").map_err(|e| map_sqlx_error("stock", e))?;
                Ok(Stock::from_stored(key, quantity, last_update)?)
            }
            None => Ok(Stock::absent(key)),
        }
    }

    #[instrument(skip(self), fields(location_id = %location_id, operation = tracing::field::Empty), err)]
    async fn stock_at_location(&self, location_id: LocationId) -> Result<Vec<Stock>, StorageError> {
        Span::current().record("operation", "stock_at_location");

        let rows = sqlx::query(
            r#"
            SELECT card_type_id, quantity, last_update
            FROM stock
            WHERE location_id = $1 AND last_update IS NOT NULL
            ORDER BY card_type_id
            "#,
        )
        .bind(location_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stock_at_location", e))?;

        rows.iter()
            .map(|row| {
                let card: Uuid = row
                    .try_get("card_type_id")
                    .map_err(|e| map_sqlx_error("stock_at_location", e))?;
                let quantity: i64 = row
                    .try_get("quantity")
                    .map_err(|e| map_sqlx_error("stock_at_location", e))?;
                let last_update: Option<DateTime<Utc>> = row
                    .try_get("last_update")
                    .map_err(|e| map_sqlx_error("stock_at_location", e))?;
                let key = StockKey::new(location_id, CardTypeId::from_uuid(card));
                Ok(Stock::from_stored(key, quantity, last_update)?)
            })
            .collect()
    }

    #[instrument(skip(self, filter), fields(limit = pagination.limit, offset = pagination.offset), err)]
    async fn movements(
        &self,
        filter: &MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<Movement>, StorageError> {
        const WHERE: &str = r#"
            WHERE ($1::uuid IS NULL OR card_type_id = $1)
              AND ($2::uuid IS NULL OR location_id = $2 OR dest_location_id = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at <= $4)
        "#;

        let card = filter.card_type_id.map(Uuid::from);
        let location = filter.location_id.map(Uuid::from);

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM movements {WHERE}"))
            .bind(card)
            .bind(location)
            .bind(filter.created_after)
            .bind(filter.created_before)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_movements", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT id, type, quantity, user_id, card_type_id, location_id, dest_location_id, created_at
            FROM movements
            {WHERE}
            ORDER BY created_at DESC, id DESC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(card)
        .bind(location)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movements", e))?;

        let items = rows.iter().map(movement_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(Page::new(items, total.max(0) as u64, pagination))
    }
}

async fn write_stock<'e, E>(executor: E, stock: &Stock, operation: &str) -> Result<(), StorageError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO stock (location_id, card_type_id, quantity, last_update)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (location_id, card_type_id) DO UPDATE
            SET quantity = EXCLUDED.quantity,
                last_update = EXCLUDED.last_update
        "#,
    )
    .bind(stock.key.location_id.as_uuid())
    .bind(stock.key.card_type_id.as_uuid())
    .bind(stock.quantity())
    .bind(stock.last_update())
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

async fn fetch_card_type<'e, E>(executor: E, id: CardTypeId) -> Result<Option<CardType>, StorageError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query("SELECT id, bank_id, name, alert_threshold FROM card_types WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error("card_type", e))?;

    row.map(|row| -> Result<CardType, sqlx::Error> {
        Ok(CardType {
            id: CardTypeId::from_uuid(row.try_get("id")?),
            bank_id: BankId::from_uuid(row.try_get("bank_id")?),
            name: row.try_get("name")?,
            alert_threshold: row.try_get("alert_threshold")?,
        })
    })
    .transpose()
    .map_err(|e| map_sqlx_error("card_type", e))
}

async fn fetch_location<'e, E>(executor: E, id: LocationId) -> Result<Option<Location>, StorageError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query("SELECT id, bank_id, name FROM locations WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error("location", e))?;

    row.map(|row| -> Result<Location, sqlx::Error> {
        Ok(Location {
            id: LocationId::from_uuid(row.try_get("id")?),
            bank_id: BankId::from_uuid(row.try_get("bank_id")?),
            name: row.try_get("name")?,
        })
    })
    .transpose()
    .map_err(|e| map_sqlx_error("location", e))
}

fn movement_from_row(row: &PgRow) -> Result<Movement, StorageError> {
    let get = |e| map_sqlx_error("movements", e);

    let id: Uuid = row.try_get("id").map_err(get)?;
    let movement_type: String = row.try_get("type").map_err(get)?;
    let quantity: i64 = row.try_get("quantity").map_err(get)?;
    let user_id: Uuid = row.try_get("user_id").map_err(get)?;
    let card_type_id: Uuid = row.try_get("card_type_id").map_err(get)?;
    let location_id: Uuid = row.try_get("location_id").map_err(get)?;
    let dest_location_id: Option<Uuid> = row.try_get("dest_location_id").map_err(get)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(get)?;

    let movement_type: MovementType = movement_type
        .parse()
        .map_err(|e: cardstock_core::DomainError| StorageError::Corrupt(format!("movement {id}: {e}")))?;

    Ok(Movement::from_stored(
        MovementId::from_uuid(id),
        movement_type,
        dest_location_id.map(LocationId::from_uuid),
        quantity,
        UserId::from_uuid(user_id),
        CardTypeId::from_uuid(card_type_id),
        LocationId::from_uuid(location_id),
        created_at,
    )?)
}
