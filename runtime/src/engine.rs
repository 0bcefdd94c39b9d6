//! The relay engine: one CONSUME → PERSIST → PUBLISH cycle per event.
//!
//! # Overview
//!
//! [`RelayEngine::handle`] turns one inbound event into one persisted record
//! and one forwarded message:
//!
//! ```text
//! InboundEvent ──validate──▶ PersistedRecord ──insert──▶ Record Store
//!                                  │
//!                                  └──derive──▶ ForwardedMessage ──publish──▶ Stream Sink
//! ```
//!
//! The two writes share no transaction. The engine enforces their order
//! instead: a message is published only after its record is committed, and
//! a receipt is returned only after both succeed. The caller acknowledges the
//! broker delivery on receipt; any error leaves it unacknowledged.
//!
//! The engine holds no mutable state and is shared across shard workers
//! through an `Arc`.

use crate::metrics::RelayMetrics;
use order_relay_core::environment::{Clock, IdGenerator, RandomIdGenerator, SystemClock};
use order_relay_core::error::{RelayError, RelayStep};
use order_relay_core::event::InboundEvent;
use order_relay_core::record::{ForwardedMessage, PersistedRecord};
use order_relay_core::record_store::RecordStore;
use order_relay_core::stream_sink::{PublishAck, StreamSink};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default bound on a record store insert.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a stream publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a successful relay cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReceipt {
    /// The record that was stored
    pub record: PersistedRecord,
    /// Where the forwarded message landed
    pub ack: PublishAck,
}

/// Persists and forwards inbound events.
///
/// # Example
///
/// ```ignore
/// let engine = RelayEngine::new(store, sink)
///     .with_store_timeout(Duration::from_secs(2))
///     .with_publish_timeout(Duration::from_secs(2));
///
/// let receipt = engine.handle_payload(&delivery.payload).await?;
/// source.acknowledge(&delivery.metadata).await?;
/// ```
pub struct RelayEngine {
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn StreamSink>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    store_timeout: Duration,
    publish_timeout: Duration,
}

impl RelayEngine {
    /// Create an engine over the given store and sink, using the system clock
    /// and random record ids.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, sink: Arc<dyn StreamSink>) -> Self {
        Self {
            store,
            sink,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIdGenerator),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Replace the clock used for `processed_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the record id generator.
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Bound each record store insert.
    #[must_use]
    pub const fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Bound each stream publish.
    #[must_use]
    pub const fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// The stream sink, for flushing at shutdown.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn StreamSink> {
        &self.sink
    }

    /// Decode a broker payload and relay it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MalformedEvent`] if the payload does not decode,
    /// otherwise whatever [`handle`](Self::handle) returns.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<RelayReceipt, RelayError> {
        let started = Instant::now();
        match InboundEvent::decode(payload) {
            Ok(event) => self.handle(&event).await,
            Err(error) => {
                tracing::warn!(error = %error, "Rejecting malformed event");
                RelayMetrics::record_failure(&error, started.elapsed());
                Err(error)
            },
        }
    }

    /// Relay one event: validate, persist, then publish.
    ///
    /// # Errors
    ///
    /// - [`RelayError::MalformedEvent`] if validation fails; nothing is written
    /// - [`RelayError::StoreWriteFailed`] or a persist [`RelayError::Timeout`];
    ///   nothing is published
    /// - [`RelayError::PublishFailed`] or a publish [`RelayError::Timeout`]; the
    ///   stored record is kept
    pub async fn handle(&self, event: &InboundEvent) -> Result<RelayReceipt, RelayError> {
        let started = Instant::now();
        let result = self.relay(event).await;

        match &result {
            Ok(receipt) => {
                RelayMetrics::record_processed(started.elapsed());
                tracing::info!(
                    order_id = %event.order_id,
                    analytics_id = %receipt.record.id,
                    topic = %receipt.ack.topic,
                    partition = receipt.ack.partition,
                    offset = receipt.ack.offset,
                    "Relayed order event"
                );
            },
            Err(error) => {
                RelayMetrics::record_failure(error, started.elapsed());
                tracing::warn!(
                    order_id = %event.order_id,
                    error = %error,
                    retryable = error.is_retryable(),
                    "Relay failed"
                );
            },
        }

        result
    }

    async fn relay(&self, event: &InboundEvent) -> Result<RelayReceipt, RelayError> {
        event.validate()?;

        tracing::debug!(
            order_id = %event.order_id,
            customer_name = %event.customer_name,
            total_amount = %event.total_amount,
            "Processing order event"
        );

        let record = PersistedRecord::derive(event, self.ids.next_id(), self.clock.now());

        bounded(RelayStep::Persist, self.store_timeout, self.store.insert(&record)).await??;
        tracing::debug!(
            order_id = %record.order_id,
            analytics_id = %record.id,
            "Stored analytics record"
        );

        let message = ForwardedMessage::from(&record);
        let ack = bounded(RelayStep::Publish, self.publish_timeout, self.sink.publish(&message))
            .await?
            .inspect_err(|error| {
                tracing::warn!(
                    analytics_id = %record.id,
                    error = %error,
                    "Record stored but publish failed; it will be stored again on redelivery"
                );
            })?;

        Ok(RelayReceipt { record, ack })
    }
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("store_timeout", &self.store_timeout)
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}

/// Run `future` under `timeout`, mapping expiry to [`RelayError::Timeout`].
async fn bounded<F, T>(step: RelayStep, timeout: Duration, future: F) -> Result<T, RelayError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| RelayError::Timeout { step, timeout })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use order_relay_testing::{
        InMemoryRecordStore, InMemoryStreamSink, SequentialIdGenerator, order_created_json,
        test_clock,
    };
    use uuid::Uuid;

    fn engine(store: &Arc<InMemoryRecordStore>, sink: &Arc<InMemoryStreamSink>) -> RelayEngine {
        RelayEngine::new(store.clone(), sink.clone())
            .with_clock(Arc::new(test_clock()))
            .with_id_generator(Arc::new(SequentialIdGenerator::new()))
    }

    fn payload() -> Vec<u8> {
        order_created_json(
            "6f1c2d3e-0000-4000-8000-000000000001",
            "Alice",
            "100.00",
            "2024-01-01T00:00:00Z",
        )
    }

    #[tokio::test]
    async fn receipt_carries_record_and_ack() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sink = Arc::new(InMemoryStreamSink::new());

        let receipt = engine(&store, &sink).handle_payload(&payload()).await.unwrap();

        assert_eq!(receipt.record.id, Uuid::from_u128(1));
        assert_eq!(receipt.record.processed_at, test_clock().now());
        assert_eq!(receipt.ack.topic, "stream-analytics");
        assert_eq!(store.records(), vec![receipt.record.clone()]);
        assert_eq!(sink.published()[0].key, receipt.record.id.to_string());
    }

    #[tokio::test]
    async fn slow_store_times_out_before_publish() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sink = Arc::new(InMemoryStreamSink::new());
        store.set_latency(Some(Duration::from_millis(200)));

        let err = engine(&store, &sink)
            .with_store_timeout(Duration::from_millis(20))
            .handle_payload(&payload())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RelayError::Timeout {
                step: RelayStep::Persist,
                timeout: Duration::from_millis(20)
            }
        );
        assert!(store.is_empty());
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn slow_publish_times_out_after_store() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sink = Arc::new(InMemoryStreamSink::new());
        sink.set_latency(Some(Duration::from_millis(200)));

        let err = engine(&store, &sink)
            .with_publish_timeout(Duration::from_millis(20))
            .handle_payload(&payload())
            .await
            .unwrap_err();

        assert_eq!(err.step(), Some(RelayStep::Publish));
        assert!(err.is_retryable());
        assert_eq!(store.len(), 1);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn each_attempt_gets_a_fresh_id() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sink = Arc::new(InMemoryStreamSink::new());
        let engine = engine(&store, &sink);

        let first = engine.handle_payload(&payload()).await.unwrap();
        let second = engine.handle_payload(&payload()).await.unwrap();

        assert_ne!(first.record.id, second.record.id);
        assert_eq!(first.record.order_id, second.record.order_id);
        assert_eq!(store.len(), 2);
    }
}
