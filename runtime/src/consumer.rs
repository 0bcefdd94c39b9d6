//! `RelayConsumer`: the consumption loop around [`RelayEngine`].
//!
//! # Overview
//!
//! The consumer subscribes to a [`DeliverySource`] and routes each delivery to
//! the worker for its shard. Each shard worker is one Tokio task that handles
//! its deliveries strictly one after another, so per-shard order holds while
//! shards proceed concurrently:
//!
//! ```text
//!                    ┌──────────────┐
//! DeliverySource ──▶ │ RelayConsumer│
//!                    └──┬────┬────┬─┘
//!               shard 0 │    │    │ shard N
//!                       ▼    ▼    ▼
//!                   ┌──────┐    ┌──────┐
//!                   │worker│ …  │worker│ ──▶ RelayEngine ──▶ acknowledge
//!                   └──────┘    └──────┘
//! ```
//!
//! # Dispositions
//!
//! - Success: acknowledge.
//! - Malformed payload: dead-letter, then acknowledge. Never retried.
//! - Any other failure: leave unacknowledged, back off, and handle the same
//!   payload again with `attempt + 1`. The shard is blocked meanwhile. Once
//!   the redelivery budget is spent the delivery is dead-lettered and
//!   acknowledged. If it cannot be dead-lettered it stays unacknowledged and
//!   the shard stops, so the broker redelivers it after a restart.
//!
//! The dispatcher never waits on a shard worker. Deliveries for a busy shard
//! are parked in that shard's backlog, so one stalled shard does not hold up
//! the others.
//!
//! Every redelivery runs the full cycle again, so a failed publish followed by
//! a successful redelivery leaves two records in the store.
//!
//! # Shutdown
//!
//! Sending `true` on the shutdown channel stops reading from the source. Each
//! worker finishes the delivery it is handling, bounded by the drain timeout,
//! and leaves queued deliveries unacknowledged for the broker to redeliver.

use crate::engine::RelayEngine;
use crate::metrics::RelayMetrics;
use crate::retry::RetryPolicy;
use futures::StreamExt;
use order_relay_core::delivery::{
    DeadLetterSink, Delivery, DeliveryMetadata, DeliverySource, SourceError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// Default capacity of each shard worker's queue.
pub const DEFAULT_SHARD_BUFFER: usize = 16;

/// Default bound on draining in-flight deliveries at shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often parked deliveries are offered to their shard worker again.
const BACKLOG_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Drives a [`RelayEngine`] from a [`DeliverySource`].
///
/// # Example
///
/// ```ignore
/// let (consumer, shutdown) = RelayConsumer::new(engine, source);
/// let consumer = consumer
///     .with_dead_letters(dead_letters)
///     .with_redelivery_policy(RetryPolicy::builder().max_retries(10).build());
///
/// tokio::spawn(async move {
///     shutdown_signal().await;
///     shutdown.send(true).ok();
/// });
///
/// consumer.run().await?;
/// ```
pub struct RelayConsumer {
    engine: Arc<RelayEngine>,
    source: Arc<dyn DeliverySource>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    redelivery: RetryPolicy,
    shard_buffer: usize,
    drain_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl RelayConsumer {
    /// Create a consumer and the sender that stops it.
    ///
    /// Send `true` to stop consuming. Dropping the sender without sending
    /// leaves the consumer running until the source ends.
    #[must_use]
    pub fn new(
        engine: Arc<RelayEngine>,
        source: Arc<dyn DeliverySource>,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = Self {
            engine,
            source,
            dead_letters: None,
            redelivery: RetryPolicy::default(),
            shard_buffer: DEFAULT_SHARD_BUFFER,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            shutdown: shutdown_rx,
        };

        (consumer, shutdown_tx)
    }

    /// Write rejected deliveries to `sink` before acknowledging them.
    ///
    /// Without a sink malformed deliveries are only logged, and deliveries
    /// that exhaust the redelivery budget stay unacknowledged.
    #[must_use]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Backoff and budget for in-process redeliveries.
    #[must_use]
    pub fn with_redelivery_policy(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    /// Capacity of each shard worker's queue.
    #[must_use]
    pub const fn with_shard_buffer(mut self, capacity: usize) -> Self {
        self.shard_buffer = if capacity == 0 { 1 } else { capacity };
        self
    }

    /// Bound on waiting for in-flight deliveries at shutdown.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Consume until shutdown is requested or the source ends, then drain.
    ///
    /// When the source ends, parked deliveries are still handed to their
    /// workers before draining.
    ///
    /// Stream errors are logged and consumption continues.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the subscription cannot be established.
    #[allow(clippy::cognitive_complexity)]
    pub async fn run(self) -> Result<(), SourceError> {
        let Self {
            engine,
            source,
            dead_letters,
            redelivery,
            shard_buffer,
            drain_timeout,
            mut shutdown,
        } = self;

        tracing::info!("Starting relay consumer");
        let mut deliveries = source.subscribe().await?;

        let worker = Arc::new(ShardWorker {
            engine,
            source,
            dead_letters,
            redelivery,
            shutdown: shutdown.clone(),
        });
        let mut routes: HashMap<i32, ShardRoute> = HashMap::new();
        let mut workers = JoinSet::new();
        let mut backlog_tick = tokio::time::interval(BACKLOG_POLL_INTERVAL);
        backlog_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut source_open = true;

        loop {
            let backlogged = routes.values().any(ShardRoute::is_backlogged);
            if !source_open && !backlogged {
                break;
            }

            tokio::select! {
                next = deliveries.next(), if source_open => match next {
                    Some(Ok(delivery)) => {
                        let shard = delivery.metadata.shard;
                        routes
                            .entry(shard)
                            .or_insert_with(|| {
                                let (tx, rx) = mpsc::channel(shard_buffer);
                                workers.spawn(Arc::clone(&worker).run(shard, rx));
                                tracing::debug!(shard, "Spawned shard worker");
                                ShardRoute::Active {
                                    queue: tx,
                                    backlog: VecDeque::new(),
                                }
                            })
                            .enqueue(shard, delivery);
                    },
                    Some(Err(error)) => {
                        tracing::error!(error = %error, "Error receiving delivery");
                    },
                    None => {
                        tracing::info!("Delivery stream ended");
                        source_open = false;
                    },
                },

                _ = backlog_tick.tick(), if backlogged => {
                    for (shard, route) in &mut routes {
                        route.flush(*shard);
                    }
                },

                () = shutdown_requested(&mut shutdown) => {
                    tracing::info!("Shutdown signal received");
                    break;
                },
            }
        }

        drop(deliveries);
        let parked: usize = routes.values().map(ShardRoute::backlog_len).sum();
        if parked > 0 {
            tracing::info!(parked, "Leaving parked deliveries unacknowledged");
        }
        drop(routes);

        tracing::info!(
            workers = workers.len(),
            timeout_ms = u64::try_from(drain_timeout.as_millis()).unwrap_or(u64::MAX),
            "Draining shard workers"
        );
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(error) = joined {
                    tracing::error!(error = %error, "Shard worker failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = workers.len(),
                "Drain timed out; unfinished deliveries stay unacknowledged"
            );
            workers.shutdown().await;
        }

        tracing::info!("Relay consumer stopped");
        Ok(())
    }
}

impl std::fmt::Debug for RelayConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConsumer")
            .field("engine", &self.engine)
            .field("dead_letters", &self.dead_letters.is_some())
            .field("redelivery", &self.redelivery)
            .field("shard_buffer", &self.shard_buffer)
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

/// Dispatcher side of one shard.
enum ShardRoute {
    /// Worker running; `backlog` holds deliveries its queue had no room for.
    Active {
        queue: mpsc::Sender<Delivery>,
        backlog: VecDeque<Delivery>,
    },
    /// Worker gone. Later deliveries stay unacknowledged so nothing past the
    /// stalled offset is committed.
    Stopped,
}

impl ShardRoute {
    fn is_backlogged(&self) -> bool {
        matches!(self, Self::Active { backlog, .. } if !backlog.is_empty())
    }

    fn backlog_len(&self) -> usize {
        match self {
            Self::Active { backlog, .. } => backlog.len(),
            Self::Stopped => 0,
        }
    }

    /// Hand `delivery` to the worker behind any backlog, without waiting.
    fn enqueue(&mut self, shard: i32, delivery: Delivery) {
        let Self::Active { backlog, .. } = self else {
            tracing::debug!(
                shard,
                offset = delivery.metadata.offset,
                "Shard stopped; delivery left unacknowledged"
            );
            return;
        };
        backlog.push_back(delivery);
        self.flush(shard);
    }

    /// Move backlog into the worker queue until it is full.
    fn flush(&mut self, shard: i32) {
        let Self::Active { queue, backlog } = self else {
            return;
        };

        while let Some(delivery) = backlog.pop_front() {
            match queue.try_send(delivery) {
                Ok(()) => {},
                Err(TrySendError::Full(delivery)) => {
                    backlog.push_front(delivery);
                    return;
                },
                Err(TrySendError::Closed(_)) => {
                    tracing::error!(
                        shard,
                        dropped = backlog.len() + 1,
                        "Shard worker stopped; deliveries left for broker redelivery"
                    );
                    *self = Self::Stopped;
                    return;
                },
            }
        }
    }
}

/// Shared state of every shard worker.
struct ShardWorker {
    engine: Arc<RelayEngine>,
    source: Arc<dyn DeliverySource>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    redelivery: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl ShardWorker {
    async fn run(self: Arc<Self>, shard: i32, mut queue: mpsc::Receiver<Delivery>) {
        let mut shutdown = self.shutdown.clone();

        while let Some(delivery) = queue.recv().await {
            if *shutdown.borrow() {
                break;
            }
            if !self.process(delivery, &mut shutdown).await {
                break;
            }
        }

        tracing::debug!(shard, "Shard worker stopped");
    }

    /// Handle one delivery until it is acknowledged or dropped.
    ///
    /// Returns `false` if the delivery was left unacknowledged, either because
    /// shutdown interrupted a redelivery backoff or because it could not be
    /// dead-lettered. The shard stops in both cases.
    async fn process(&self, mut delivery: Delivery, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut retries = 0;

        loop {
            let error = match self.engine.handle_payload(&delivery.payload).await {
                Ok(_) => {
                    self.acknowledge(&delivery.metadata).await;
                    return true;
                },
                Err(error) => error,
            };

            let meta = &delivery.metadata;
            if !error.is_retryable() {
                tracing::warn!(
                    event_id = %meta.event_id,
                    shard = meta.shard,
                    offset = meta.offset,
                    error = %error,
                    "Rejecting delivery"
                );
                if !self.dead_letter(&delivery, &error.to_string(), error.kind()).await {
                    tracing::warn!(
                        event_id = %meta.event_id,
                        shard = meta.shard,
                        offset = meta.offset,
                        "Dropping malformed delivery"
                    );
                }
                self.acknowledge(&delivery.metadata).await;
                return true;
            }

            if !self.redelivery.allows_retry(retries) {
                tracing::error!(
                    event_id = %meta.event_id,
                    shard = meta.shard,
                    offset = meta.offset,
                    attempt = meta.attempt,
                    error = %error,
                    "Redelivery budget exhausted"
                );
                let reason = format!(
                    "redelivery budget exhausted after {} attempts: {error}",
                    meta.attempt
                );
                if !self.dead_letter(&delivery, &reason, "redelivery_exhausted").await {
                    tracing::error!(
                        event_id = %meta.event_id,
                        shard = meta.shard,
                        offset = meta.offset,
                        "Delivery not dead-lettered; leaving it unacknowledged and stopping shard"
                    );
                    return false;
                }
                self.acknowledge(&delivery.metadata).await;
                return true;
            }

            let delay = self.redelivery.delay_for_attempt(retries);
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = shutdown_requested(shutdown) => {
                    tracing::info!(
                        event_id = %meta.event_id,
                        shard = meta.shard,
                        offset = meta.offset,
                        "Shutdown during redelivery backoff; leaving delivery unacknowledged"
                    );
                    return false;
                },
            }

            retries += 1;
            delivery = delivery.redelivered();
            RelayMetrics::record_redelivery();
            tracing::info!(
                event_id = %delivery.metadata.event_id,
                shard = delivery.metadata.shard,
                offset = delivery.metadata.offset,
                attempt = delivery.metadata.attempt,
                "Redelivering"
            );
        }
    }

    async fn acknowledge(&self, meta: &DeliveryMetadata) {
        match self.source.acknowledge(meta).await {
            Ok(()) => {
                tracing::debug!(
                    event_id = %meta.event_id,
                    shard = meta.shard,
                    offset = meta.offset,
                    "Acknowledged delivery"
                );
            },
            Err(error) => {
                RelayMetrics::record_ack_failure();
                tracing::warn!(
                    event_id = %meta.event_id,
                    shard = meta.shard,
                    offset = meta.offset,
                    error = %error,
                    "Acknowledgment failed; the broker may redeliver"
                );
            },
        }
    }

    /// Returns whether `delivery` was written to the dead-letter sink.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str, label: &'static str) -> bool {
        let meta = &delivery.metadata;
        let Some(sink) = &self.dead_letters else {
            tracing::error!(
                event_id = %meta.event_id,
                shard = meta.shard,
                offset = meta.offset,
                reason,
                "No dead-letter sink configured"
            );
            return false;
        };

        match sink.dead_letter(delivery, reason).await {
            Ok(()) => {
                RelayMetrics::record_dead_lettered(label);
                tracing::info!(
                    event_id = %meta.event_id,
                    shard = meta.shard,
                    offset = meta.offset,
                    "Delivery dead-lettered"
                );
                true
            },
            Err(error) => {
                tracing::error!(
                    event_id = %meta.event_id,
                    shard = meta.shard,
                    offset = meta.offset,
                    error = %error,
                    "Dead-letter write failed"
                );
                false
            },
        }
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use order_relay_testing::{
        InMemoryDeliverySource, InMemoryRecordStore, InMemoryStreamSink, order_created_json,
    };

    #[tokio::test]
    async fn returns_when_source_ends() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sink = Arc::new(InMemoryStreamSink::new());
        let source = Arc::new(InMemoryDeliverySource::new());
        source.push(
            0,
            order_created_json(
                "6f1c2d3e-0000-4000-8000-000000000001",
                "Alice",
                "100.00",
                "2024-01-01T00:00:00Z",
            ),
        );
        source.close();

        let engine = Arc::new(RelayEngine::new(store.clone(), sink.clone()));
        let (consumer, _shutdown) = RelayConsumer::new(engine, source.clone());
        consumer.run().await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(source.ack_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_before_any_delivery_returns() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sink = Arc::new(InMemoryStreamSink::new());
        let source = Arc::new(InMemoryDeliverySource::new());

        let engine = Arc::new(RelayEngine::new(store, sink));
        let (consumer, shutdown) = RelayConsumer::new(engine, source);
        shutdown.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), consumer.run())
            .await
            .unwrap()
            .unwrap();
    }
}
