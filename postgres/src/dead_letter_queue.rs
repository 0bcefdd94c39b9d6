//! Dead Letter Queue (DLQ) for rejected deliveries.
//!
//! A delivery lands here when its payload cannot be decoded or when its
//! redelivery budget runs out. The raw payload is kept byte-for-byte together
//! with where it came from, so an operator can inspect it and decide whether
//! to replay or discard it.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE failed_deliveries (
//!     id BIGSERIAL PRIMARY KEY,
//!     event_id TEXT NOT NULL,
//!     topic TEXT NOT NULL,
//!     shard INTEGER NOT NULL,
//!     delivery_offset BIGINT NOT NULL,
//!     attempt INTEGER NOT NULL,
//!     payload BYTEA NOT NULL,
//!     error_message TEXT NOT NULL,
//!     received_at TIMESTAMPTZ NOT NULL,
//!     failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     resolved_at TIMESTAMPTZ,
//!     resolved_by TEXT,
//!     resolution_notes TEXT
//! );
//! ```

use chrono::{DateTime, Utc};
use order_relay_core::delivery::{DeadLetterSink, Delivery, DeliveryMetadata};
use order_relay_core::record_store::StoreError;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Status of a rejected delivery in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for someone to look at it
    Pending,
    /// Being replayed or investigated
    Processing,
    /// Replayed successfully or otherwise dealt with
    Resolved,
    /// Given up on
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::DatabaseError(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedDelivery {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// The delivery as it was last seen, payload untouched
    pub delivery: Delivery,

    /// Why it was rejected
    pub error_message: String,

    /// When it was rejected
    pub failed_at: DateTime<Utc>,

    /// Current handling status
    pub status: DLQStatus,

    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved it
    pub resolved_by: Option<String>,

    /// Free-form notes left on resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue for rejected deliveries.
///
/// # Example
///
/// ```ignore
/// let dlq = PostgresDeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// for entry in &pending {
///     dlq.mark_discarded(entry.id, "unparseable test traffic").await?;
/// }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

impl PostgresDeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a rejected delivery to the DLQ.
    ///
    /// # Returns
    ///
    /// The unique ID of the created DLQ entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the insert fails.
    pub async fn add_entry(&self, delivery: &Delivery, reason: &str) -> Result<i64, StoreError> {
        let metadata = &delivery.metadata;
        let attempt = i32::try_from(metadata.attempt).unwrap_or(i32::MAX);

        let id: (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_deliveries (
                event_id, topic, shard, delivery_offset, attempt,
                payload, error_message, received_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(&metadata.event_id)
        .bind(&metadata.topic)
        .bind(metadata.shard)
        .bind(metadata.offset)
        .bind(attempt)
        .bind(&delivery.payload)
        .bind(reason)
        .bind(metadata.received_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::warn!(
            dlq_id = id.0,
            event_id = %metadata.event_id,
            topic = %metadata.topic,
            shard = metadata.shard,
            offset = metadata.offset,
            attempt = metadata.attempt,
            error = reason,
            "Delivery added to Dead Letter Queue"
        );

        metrics::counter!("relay_dlq_added_total", "topic" => metadata.topic.clone()).increment(1);

        Ok(id.0)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedDelivery>, StoreError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries with the given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedDelivery>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT
                id, event_id, topic, shard, delivery_offset, attempt, payload,
                error_message, received_at, failed_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM failed_deliveries
            WHERE status = $1
            ORDER BY failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_delivery).collect()
    }

    /// Get a specific entry by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the query fails or the entry does not exist.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedDelivery, StoreError> {
        let row = sqlx::query(
            r"
            SELECT
                id, event_id, topic, shard, delivery_offset, attempt, payload,
                error_message, received_at, failed_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM failed_deliveries
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        Self::row_to_failed_delivery(&row)
    }

    /// Update the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE failed_deliveries SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark an entry as resolved.
    ///
    /// `resolved_by` names the operator or service that handled it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_deliveries
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "DLQ entry marked as resolved");

        metrics::counter!("relay_dlq_resolved_total").increment(1);

        Ok(())
    }

    /// Mark an entry as discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_deliveries
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");

        metrics::counter!("relay_dlq_discarded_total").increment(1);

        Ok(())
    }

    /// Number of entries still pending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_deliveries WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        Ok(count)
    }

    fn row_to_failed_delivery(row: &sqlx::postgres::PgRow) -> Result<FailedDelivery, StoreError> {
        let status: String = row.get("status");
        let status = DLQStatus::parse(&status)?;

        let attempt: i32 = row.get("attempt");
        let attempt = u32::try_from(attempt)
            .map_err(|_| StoreError::DatabaseError(format!("Invalid attempt count: {attempt}")))?;

        Ok(FailedDelivery {
            id: row.get("id"),
            delivery: Delivery {
                payload: row.get("payload"),
                metadata: DeliveryMetadata {
                    event_id: row.get("event_id"),
                    topic: row.get("topic"),
                    shard: row.get("shard"),
                    offset: row.get("delivery_offset"),
                    attempt,
                    received_at: row.get("received_at"),
                },
            },
            error_message: row.get("error_message"),
            failed_at: row.get("failed_at"),
            status,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for PostgresDeadLetterQueue {
    fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let delivery = delivery.clone();
        let reason = reason.to_string();
        Box::pin(async move { self.add_entry(&delivery, &reason).await.map(|_| ()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn dlq_status_roundtrip() {
        for status in &[
            DLQStatus::Pending,
            DLQStatus::Processing,
            DLQStatus::Resolved,
            DLQStatus::Discarded,
        ] {
            let parsed = DLQStatus::parse(status.as_str()).expect("valid status should parse");
            assert_eq!(*status, parsed);
        }
    }

    #[test]
    fn dlq_status_invalid() {
        assert!(matches!(
            DLQStatus::parse("Pending"),
            Err(StoreError::DatabaseError(_))
        ));
    }
}
