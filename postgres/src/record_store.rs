//! PostgreSQL-backed record store.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE analytics_records (
//!     id UUID PRIMARY KEY,
//!     order_id UUID NOT NULL,
//!     customer_name TEXT NOT NULL,
//!     total_amount NUMERIC NOT NULL,
//!     processed_at TIMESTAMPTZ NOT NULL,
//!     processing_status TEXT NOT NULL
//! );
//! ```
//!
//! Inserts are single-statement and autocommitted, so a row is either fully
//! written or absent. Nothing is deduplicated: a redelivered event is stored
//! again under a new id.

use chrono::{DateTime, Utc};
use order_relay_core::record::{PersistedRecord, ProcessingStatus};
use order_relay_core::record_store::{RecordStore, StoreError};
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Table used when none is configured.
pub const DEFAULT_TABLE: &str = "analytics_records";

/// Open a bounded connection pool.
///
/// # Errors
///
/// Returns [`StoreError::ConnectionFailed`] if no connection can be established
/// within `connect_timeout`.
pub async fn connect_pool(
    database_url: &str,
    max_connections: u32,
    connect_timeout: Duration,
) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(connect_timeout)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::ConnectionFailed(format!("Failed to connect: {e}")))
}

/// Record store writing one row per [`PersistedRecord`].
///
/// # Example
///
/// ```ignore
/// let store = PostgresRecordStore::new(pool).with_table("analytics_records")?;
/// store.insert(&record).await?;
/// let stored = store.find_by_id(record.id).await?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresRecordStore {
    pool: PgPool,
    table_name: String,
}

impl PostgresRecordStore {
    /// Create a store over `pool` writing to [`DEFAULT_TABLE`].
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table_name: DEFAULT_TABLE.to_string(),
        }
    }

    /// Write to `table_name` instead.
    ///
    /// The name is interpolated into SQL, so only identifiers made of ASCII
    /// letters, digits and underscores (optionally schema-qualified) are
    /// accepted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] for an invalid table name.
    pub fn with_table(mut self, table_name: impl Into<String>) -> Result<Self, StoreError> {
        let table_name = table_name.into();
        if !is_valid_table_name(&table_name) {
            return Err(StoreError::DatabaseError(format!(
                "Invalid table name: {table_name:?}"
            )));
        }
        self.table_name = table_name;
        Ok(self)
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the table this store writes to.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Load one record by its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the row is corrupt.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<PersistedRecord>, StoreError> {
        let query = format!(
            "SELECT id, order_id, customer_name, total_amount, processed_at, processing_status
             FROM {} WHERE id = $1",
            self.table_name
        );

        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Load every record derived from one order, oldest first.
    ///
    /// More than one row means the order's event was redelivered.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    pub async fn find_by_order(&self, order_id: Uuid) -> Result<Vec<PersistedRecord>, StoreError> {
        let query = format!(
            "SELECT id, order_id, customer_name, total_amount, processed_at, processing_status
             FROM {} WHERE order_id = $1
             ORDER BY processed_at ASC",
            self.table_name
        );

        let rows = sqlx::query(&query)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter().map(row_to_record).collect()
    }
}

impl RecordStore for PostgresRecordStore {
    fn insert(
        &self,
        record: &PersistedRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            let query = format!(
                "INSERT INTO {} (id, order_id, customer_name, total_amount, processed_at, processing_status)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                self.table_name
            );

            sqlx::query(&query)
                .bind(record.id)
                .bind(record.order_id)
                .bind(&record.customer_name)
                .bind(record.total_amount)
                .bind(record.processed_at)
                .bind(record.status.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| match e {
                    sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                        StoreError::DuplicateRecord(record.id)
                    },
                    other => map_sqlx_error(other),
                })?;

            tracing::debug!(
                table = %self.table_name,
                analytics_id = %record.id,
                order_id = %record.order_id,
                "Inserted analytics record"
            );
            Ok(())
        })
    }
}

fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::ConnectionFailed(error.to_string())
        },
        other => StoreError::DatabaseError(other.to_string()),
    }
}

fn row_to_record(row: &PgRow) -> Result<PersistedRecord, StoreError> {
    let column = |e: sqlx::Error| StoreError::DatabaseError(e.to_string());

    let status: String = row.try_get("processing_status").map_err(column)?;
    let status = ProcessingStatus::parse(&status)
        .ok_or_else(|| StoreError::DatabaseError(format!("Invalid processing status: {status}")))?;
    let total_amount: Decimal = row.try_get("total_amount").map_err(column)?;
    let processed_at: DateTime<Utc> = row.try_get("processed_at").map_err(column)?;

    Ok(PersistedRecord {
        id: row.try_get("id").map_err(column)?,
        order_id: row.try_get("order_id").map_err(column)?,
        customer_name: row.try_get("customer_name").map_err(column)?,
        total_amount,
        processed_at,
        status,
    })
}

fn is_valid_table_name(name: &str) -> bool {
    let mut parts = 0;
    for part in name.split('.') {
        parts += 1;
        let mut chars = part.chars();
        let starts_well = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !starts_well || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
    }
    parts <= 2
}
