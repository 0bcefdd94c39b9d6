//! The inbound `OrderCreated` event and its wire decoding.
//!
//! The broker body is JSON:
//!
//! ```json
//! {
//!   "orderId": "2c5ea4c0-4067-11e9-8bad-9b1deb4d3b7d",
//!   "customerName": "Alice",
//!   "totalAmount": "100.00",
//!   "createdAt": "2024-01-01T00:00:00Z"
//! }
//! ```
//!
//! `totalAmount` may be a JSON string or number. A MassTransit-style envelope
//! (`{"messageId": ..., "message": {...}}`) is unwrapped before decoding.
//! Any decoding or validation failure is a [`RelayError::MalformedEvent`],
//! which is never retried.

use crate::error::RelayError;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// An `OrderCreated` fact emitted by the order service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Identifier of the order this event describes
    #[serde(alias = "OrderId")]
    pub order_id: Uuid,

    /// Name of the customer who placed the order
    #[serde(alias = "CustomerName")]
    pub customer_name: String,

    /// Order total; never negative
    #[serde(alias = "TotalAmount", deserialize_with = "deserialize_amount")]
    pub total_amount: Decimal,

    /// When the order was created (UTC)
    #[serde(alias = "CreatedAt", deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Decode and validate a broker payload.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MalformedEvent`] if the payload is not JSON, is
    /// missing a field, has a field of the wrong shape, or fails [`validate`](Self::validate).
    pub fn decode(payload: &[u8]) -> Result<Self, RelayError> {
        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| RelayError::MalformedEvent(format!("payload is not valid JSON: {e}")))?;

        let body = match body {
            Value::Object(mut map) => match map.remove("message") {
                Some(inner @ Value::Object(_)) => inner,
                Some(other) => {
                    map.insert("message".to_string(), other);
                    Value::Object(map)
                },
                None => Value::Object(map),
            },
            other => {
                return Err(RelayError::MalformedEvent(format!(
                    "expected a JSON object, found {}",
                    json_kind(&other)
                )));
            },
        };

        let event: Self = serde_json::from_value(body)
            .map_err(|e| RelayError::MalformedEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Check invariants that the type system does not enforce.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MalformedEvent`] if the amount is negative.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.total_amount.is_sign_negative() && !self.total_amount.is_zero() {
            return Err(RelayError::MalformedEvent(format!(
                "totalAmount must not be negative, got {}",
                self.total_amount
            )));
        }
        Ok(())
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

fn deserialize_amount<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => parse_decimal(&text)
            .ok_or_else(|| de::Error::custom(format!("invalid decimal amount `{text}`"))),
        Value::Number(number) => parse_decimal(&number.to_string())
            .ok_or_else(|| de::Error::custom(format!("amount {number} is out of range"))),
        other => Err(de::Error::custom(format!(
            "expected a decimal string or number, found {}",
            json_kind(&other)
        ))),
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    // Offset-less timestamps are produced for UTC instants by some publishers.
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| de::Error::custom(format!("invalid ISO-8601 timestamp `{text}`")))
}
