//! In-memory adapters for relay tests.
//!
//! Every adapter can share a [`Journal`] so a test can assert the order in
//! which store writes, publishes and acknowledgments happened, even across
//! adapters:
//! - [`InMemoryRecordStore`]: `Vec`-backed record store
//! - [`InMemoryStreamSink`]: captures published keys and bodies
//! - [`InMemoryDeliverySource`]: channel-fed source that records acknowledgments
//! - [`InMemoryDeadLetterSink`]: captures rejected deliveries

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already failed

use chrono::Utc;
use order_relay_core::delivery::{
    DeadLetterSink, Delivery, DeliveryMetadata, DeliverySource, DeliveryStream, SourceError,
};
use order_relay_core::record::{ForwardedMessage, PersistedRecord};
use order_relay_core::record_store::{RecordStore, StoreError};
use order_relay_core::stream_sink::{PublishAck, PublishError, StreamSink};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One observable side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// A record was committed to the store
    Inserted(Uuid),
    /// A message keyed by this analytics id was accepted by the sink
    Published(Uuid),
    /// A delivery was acknowledged
    Acknowledged {
        /// Shard of the delivery
        shard: i32,
        /// Offset of the delivery
        offset: i64,
    },
    /// A delivery was written to the dead-letter sink
    DeadLettered {
        /// Shard of the delivery
        shard: i32,
        /// Offset of the delivery
        offset: i64,
    },
}

/// Append-only log of side effects shared between adapters.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    /// Create an empty journal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn record(&self, entry: JournalEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    /// Snapshot of all entries in order
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Index of the first occurrence of `entry`
    #[must_use]
    pub fn position(&self, entry: &JournalEntry) -> Option<usize> {
        self.entries.lock().unwrap().iter().position(|e| e == entry)
    }

    /// Whether every `Published(id)` is preceded by an `Inserted(id)`.
    #[must_use]
    pub fn every_publish_follows_its_insert(&self) -> bool {
        let entries = self.entries();
        entries.iter().enumerate().all(|(i, entry)| match entry {
            JournalEntry::Published(id) => entries[..i].contains(&JournalEntry::Inserted(*id)),
            _ => true,
        })
    }
}

/// Counter of failures still to inject.
#[derive(Debug, Default)]
struct FailureBudget(AtomicUsize);

impl FailureBudget {
    fn set(&self, n: usize) {
        self.0.store(n, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory record store.
///
/// # Example
///
/// ```
/// use order_relay_testing::InMemoryRecordStore;
///
/// let store = InMemoryRecordStore::new();
/// store.fail_next(1); // the next insert returns a database error
/// assert!(store.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<Vec<PersistedRecord>>,
    attempts: AtomicUsize,
    failures: FailureBudget,
    failing_orders: RwLock<HashSet<Uuid>>,
    latency: RwLock<Option<Duration>>,
    journal: Option<Journal>,
}

impl InMemoryRecordStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report committed inserts to `journal`
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Fail the next `n` inserts with [`StoreError::DatabaseError`]
    pub fn fail_next(&self, n: usize) {
        self.failures.set(n);
    }

    /// Fail every insert of a record derived from `order_id`
    pub fn fail_order(&self, order_id: Uuid) {
        self.failing_orders.write().unwrap().insert(order_id);
    }

    /// Delay every insert by `latency` before it takes effect
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().unwrap() = latency;
    }

    /// All committed records in insert order
    #[must_use]
    pub fn records(&self) -> Vec<PersistedRecord> {
        self.records.read().unwrap().clone()
    }

    /// Whether a record with `id` was committed
    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.records.read().unwrap().iter().any(|r| r.id == id)
    }

    /// Number of committed records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether nothing was committed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Number of insert calls, including failed ones
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl RecordStore for InMemoryRecordStore {
    fn insert(
        &self,
        record: &PersistedRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let latency = *self.latency.read().unwrap();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if self.failures.take()
                || self.failing_orders.read().unwrap().contains(&record.order_id)
            {
                return Err(StoreError::DatabaseError("injected failure".to_string()));
            }

            let mut records = self.records.write().unwrap();
            if records.iter().any(|r| r.id == record.id) {
                return Err(StoreError::DuplicateRecord(record.id));
            }
            if let Some(journal) = &self.journal {
                journal.record(JournalEntry::Inserted(record.id));
            }
            records.push(record);
            Ok(())
        })
    }
}

/// A message captured by [`InMemoryStreamSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedMessage {
    /// Message key
    pub key: String,
    /// Encoded body exactly as it would go on the wire
    pub body: Vec<u8>,
    /// The message itself
    pub message: ForwardedMessage,
}

/// In-memory stream sink.
#[derive(Debug)]
pub struct InMemoryStreamSink {
    topic: String,
    published: RwLock<Vec<CapturedMessage>>,
    attempts: AtomicUsize,
    flushes: AtomicUsize,
    failures: FailureBudget,
    latency: RwLock<Option<Duration>>,
    journal: Option<Journal>,
}

impl Default for InMemoryStreamSink {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStreamSink {
    /// Create a sink for the `stream-analytics` topic
    #[must_use]
    pub fn new() -> Self {
        Self {
            topic: "stream-analytics".to_string(),
            published: RwLock::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            failures: FailureBudget::default(),
            latency: RwLock::new(None),
            journal: None,
        }
    }

    /// Report accepted messages to `journal`
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Fail the next `n` publishes with [`PublishError::PublishFailed`]
    pub fn fail_next(&self, n: usize) {
        self.failures.set(n);
    }

    /// Delay every publish by `latency` before it takes effect
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().unwrap() = latency;
    }

    /// All accepted messages in publish order
    #[must_use]
    pub fn published(&self) -> Vec<CapturedMessage> {
        self.published.read().unwrap().clone()
    }

    /// Number of accepted messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.published.read().unwrap().len()
    }

    /// Whether nothing was accepted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.published.read().unwrap().is_empty()
    }

    /// Number of publish calls, including failed ones
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of flush calls
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl StreamSink for InMemoryStreamSink {
    fn publish(
        &self,
        message: &ForwardedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, PublishError>> + Send + '_>> {
        let message = message.clone();
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let latency = *self.latency.read().unwrap();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if self.failures.take() {
                return Err(PublishError::PublishFailed {
                    topic: self.topic.clone(),
                    reason: "injected failure".to_string(),
                });
            }

            let body = message.to_json()?;
            let mut published = self.published.write().unwrap();
            if let Some(journal) = &self.journal {
                journal.record(JournalEntry::Published(message.analytics_id));
            }
            let offset = i64::try_from(published.len()).unwrap();
            published.push(CapturedMessage {
                key: message.key(),
                body,
                message,
            });
            Ok(PublishAck {
                topic: self.topic.clone(),
                partition: 0,
                offset,
            })
        })
    }

    fn flush(&self, _timeout: Duration) -> Result<(), PublishError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Channel-fed delivery source.
///
/// Payloads pushed with [`push`](Self::push) are delivered in order, with
/// per-shard offsets starting at 0. [`close`](Self::close) ends the stream.
#[derive(Debug)]
pub struct InMemoryDeliverySource {
    topic: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    next_offsets: Mutex<HashMap<i32, i64>>,
    acknowledged: RwLock<Vec<DeliveryMetadata>>,
    ack_failures: FailureBudget,
    journal: Option<Journal>,
}

impl Default for InMemoryDeliverySource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDeliverySource {
    /// Create an open source for the `order-created` topic
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            topic: "order-created".to_string(),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            next_offsets: Mutex::new(HashMap::new()),
            acknowledged: RwLock::new(Vec::new()),
            ack_failures: FailureBudget::default(),
            journal: None,
        }
    }

    /// Report acknowledgments to `journal`
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Enqueue a payload on `shard` and return its metadata.
    pub fn push(&self, shard: i32, payload: impl Into<Vec<u8>>) -> DeliveryMetadata {
        let offset = {
            let mut offsets = self.next_offsets.lock().unwrap();
            let next = offsets.entry(shard).or_insert(0);
            let offset = *next;
            *next += 1;
            offset
        };
        let metadata = DeliveryMetadata {
            event_id: format!("{}-{shard}-{offset}", self.topic),
            topic: self.topic.clone(),
            shard,
            offset,
            attempt: 1,
            received_at: Utc::now(),
        };
        let delivery = Delivery {
            payload: payload.into(),
            metadata: metadata.clone(),
        };
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(delivery);
        }
        metadata
    }

    /// End the stream once queued deliveries are consumed
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }

    /// Fail the next `n` acknowledgments
    pub fn fail_next_acks(&self, n: usize) {
        self.ack_failures.set(n);
    }

    /// All acknowledged deliveries in order
    #[must_use]
    pub fn acknowledged(&self) -> Vec<DeliveryMetadata> {
        self.acknowledged.read().unwrap().clone()
    }

    /// Number of acknowledged deliveries
    #[must_use]
    pub fn ack_count(&self) -> usize {
        self.acknowledged.read().unwrap().len()
    }

    /// Acknowledged offsets of one shard, in acknowledgment order
    #[must_use]
    pub fn acknowledged_offsets(&self, shard: i32) -> Vec<i64> {
        self.acknowledged
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.shard == shard)
            .map(|m| m.offset)
            .collect()
    }
}

impl DeliverySource for InMemoryDeliverySource {
    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let mut receiver =
                self.receiver
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| SourceError::SubscriptionFailed {
                        topic: self.topic.clone(),
                        reason: "already subscribed".to_string(),
                    })?;

            let stream = async_stream::stream! {
                while let Some(delivery) = receiver.recv().await {
                    yield Ok::<Delivery, SourceError>(delivery);
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn acknowledge(
        &self,
        metadata: &DeliveryMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let metadata = metadata.clone();
        Box::pin(async move {
            if self.ack_failures.take() {
                return Err(SourceError::CommitFailed {
                    shard: metadata.shard,
                    offset: metadata.offset,
                    reason: "injected failure".to_string(),
                });
            }
            if let Some(journal) = &self.journal {
                journal.record(JournalEntry::Acknowledged {
                    shard: metadata.shard,
                    offset: metadata.offset,
                });
            }
            self.acknowledged.write().unwrap().push(metadata);
            Ok(())
        })
    }
}

/// Captures dead-lettered deliveries.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    entries: RwLock<Vec<(Delivery, String)>>,
    failures: FailureBudget,
    journal: Option<Journal>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report dead letters to `journal`
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Fail the next `n` writes
    pub fn fail_next(&self, n: usize) {
        self.failures.set(n);
    }

    /// Captured deliveries and reasons
    #[must_use]
    pub fn entries(&self) -> Vec<(Delivery, String)> {
        self.entries.read().unwrap().clone()
    }

    /// Number of captured deliveries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether nothing was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let delivery = delivery.clone();
        let reason = reason.to_string();
        Box::pin(async move {
            if self.failures.take() {
                return Err(StoreError::DatabaseError("injected failure".to_string()));
            }
            if let Some(journal) = &self.journal {
                journal.record(JournalEntry::DeadLettered {
                    shard: delivery.metadata.shard,
                    offset: delivery.metadata.offset,
                });
            }
            self.entries.write().unwrap().push((delivery, reason));
            Ok(())
        })
    }
}
