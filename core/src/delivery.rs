//! Broker-side abstractions: deliveries, acknowledgment and dead letters.
//!
//! A [`DeliverySource`] yields [`Delivery`] values that stay "in flight"
//! until they are acknowledged. A delivery that is never acknowledged is
//! delivered again, either by the consumer loop while it runs or by the
//! broker after a restart.
//!
//! # Sharding
//!
//! Every delivery carries a `shard` (the broker partition). Deliveries on the
//! same shard are processed strictly in order; different shards proceed
//! concurrently.

use crate::record_store::StoreError;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Broker metadata attached to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMetadata {
    /// Broker-level identity of the event
    pub event_id: String,
    /// Topic or queue the delivery came from
    pub topic: String,
    /// Ordering shard (partition)
    pub shard: i32,
    /// Position within the shard
    pub offset: i64,
    /// 1 for the first attempt, incremented on each redelivery
    pub attempt: u32,
    /// When the delivery was received
    pub received_at: DateTime<Utc>,
}

/// One inbound message awaiting processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Raw message body
    pub payload: Vec<u8>,
    /// Broker metadata
    pub metadata: DeliveryMetadata,
}

impl Delivery {
    /// The same delivery, marked as the next attempt.
    #[must_use]
    pub fn redelivered(mut self) -> Self {
        self.metadata.attempt = self.metadata.attempt.saturating_add(1);
        self
    }
}

/// Errors raised by a delivery source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to subscribe to the topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to acknowledge a delivery
    #[error("Commit failed for shard {shard} at offset {offset}: {reason}")]
    CommitFailed {
        /// Shard of the delivery
        shard: i32,
        /// Offset of the delivery
        offset: i64,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error while receiving
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, SourceError>> + Send>>;

/// Inbound broker with explicit acknowledgment.
pub trait DeliverySource: Send + Sync {
    /// Start receiving deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the subscription cannot be established.
    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, SourceError>> + Send + '_>>;

    /// Mark a delivery as consumed so it is not redelivered.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::CommitFailed`] if the broker rejects the commit.
    fn acknowledge(
        &self,
        metadata: &DeliveryMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>>;
}

/// Destination for deliveries that will never be processed.
pub trait DeadLetterSink: Send + Sync {
    /// Record a rejected delivery along with the reason.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the entry could not be written.
    fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}
