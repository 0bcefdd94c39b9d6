//! Persisted analytics records and the messages forwarded from them.

use crate::event::InboundEvent;
use crate::stream_sink::PublishError;
use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Processing outcome stored with each record.
///
/// The relay only ever writes [`ProcessingStatus::Processed`]; the other
/// values are reserved for downstream tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    /// Successfully processed
    Processed,
    /// Processing failed
    Failed,
    /// Processing is being retried
    Retrying,
}

impl ProcessingStatus {
    /// Textual form stored in the database and sent on the stream.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "Processed",
            Self::Failed => "Failed",
            Self::Retrying => "Retrying",
        }
    }

    /// Parse the textual form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Processed" => Some(Self::Processed),
            "Failed" => Some(Self::Failed),
            "Retrying" => Some(Self::Retrying),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The analytics fact written to the record store.
///
/// Immutable once written. The id is generated per processing attempt and is
/// never derived from the inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    /// Record identifier, unique per attempt
    pub id: Uuid,
    /// Order the record was derived from
    pub order_id: Uuid,
    /// Customer name copied from the event
    pub customer_name: String,
    /// Order total copied from the event
    pub total_amount: Decimal,
    /// When the relay processed the event
    pub processed_at: DateTime<Utc>,
    /// Processing outcome
    pub status: ProcessingStatus,
}

impl PersistedRecord {
    /// Build the record for one processing attempt of `event`.
    ///
    /// `processed_at` is truncated to microseconds, the precision of
    /// `timestamptz`, so a stored record reads back equal to this one.
    #[must_use]
    pub fn derive(event: &InboundEvent, id: Uuid, processed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            order_id: event.order_id,
            customer_name: event.customer_name.clone(),
            total_amount: event.total_amount,
            processed_at: processed_at.trunc_subsecs(6),
            status: ProcessingStatus::Processed,
        }
    }
}

/// Projection of a [`PersistedRecord`] onto the outbound stream.
///
/// Field names on the wire are PascalCase:
///
/// ```json
/// {
///   "AnalyticsId": "…",
///   "OrderId": "…",
///   "CustomerName": "Alice",
///   "TotalAmount": 100.00,
///   "ProcessedAt": "2024-01-01T00:00:05Z",
///   "ProcessingStatus": "Processed"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ForwardedMessage {
    /// Same value as the record id
    pub analytics_id: Uuid,
    /// Order the record was derived from
    pub order_id: Uuid,
    /// Customer name
    pub customer_name: String,
    /// Order total, serialized as a JSON number that keeps its scale
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub total_amount: Decimal,
    /// When the relay processed the event
    pub processed_at: DateTime<Utc>,
    /// Processing outcome
    pub processing_status: ProcessingStatus,
}

impl From<&PersistedRecord> for ForwardedMessage {
    fn from(record: &PersistedRecord) -> Self {
        Self {
            analytics_id: record.id,
            order_id: record.order_id,
            customer_name: record.customer_name.clone(),
            total_amount: record.total_amount,
            processed_at: record.processed_at,
            processing_status: record.status,
        }
    }
}

impl ForwardedMessage {
    /// Message key on the stream: the analytics id.
    #[must_use]
    pub fn key(&self) -> String {
        self.analytics_id.to_string()
    }

    /// Encode the message body.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>, PublishError> {
        serde_json::to_vec(self).map_err(|e| PublishError::Serialization(e.to_string()))
    }
}
