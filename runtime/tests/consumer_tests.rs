//! `RelayConsumer` tests: shard ordering and independence, redelivery budget,
//! shutdown drain.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use order_relay_runtime::{RelayConsumer, RelayEngine, RetryPolicy};
use order_relay_testing::{
    InMemoryDeadLetterSink, InMemoryDeliverySource, InMemoryRecordStore, InMemoryStreamSink,
    eventually, order_created_json,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn order(n: u128) -> Vec<u8> {
    order_created_json(
        &Uuid::from_u128(n).to_string(),
        "Carol",
        "9.99",
        "2024-02-29T23:59:59.999Z",
    )
}

fn fast_redelivery() -> RetryPolicy {
    RetryPolicy::builder()
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

struct Fixture {
    store: Arc<InMemoryRecordStore>,
    sink: Arc<InMemoryStreamSink>,
    source: Arc<InMemoryDeliverySource>,
    dead_letters: Arc<InMemoryDeadLetterSink>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: Arc::new(InMemoryRecordStore::new()),
            sink: Arc::new(InMemoryStreamSink::new()),
            source: Arc::new(InMemoryDeliverySource::new()),
            dead_letters: Arc::new(InMemoryDeadLetterSink::new()),
        }
    }

    fn consumer(&self, policy: RetryPolicy) -> (RelayConsumer, tokio::sync::watch::Sender<bool>) {
        let engine = Arc::new(RelayEngine::new(self.store.clone(), self.sink.clone()));
        let (consumer, shutdown) = RelayConsumer::new(engine, self.source.clone());
        (
            consumer
                .with_dead_letters(self.dead_letters.clone())
                .with_redelivery_policy(policy)
                .with_shard_buffer(4)
                .with_drain_timeout(Duration::from_secs(5)),
            shutdown,
        )
    }
}

#[tokio::test]
async fn acknowledges_each_shard_in_order() {
    let f = Fixture::new();
    for n in 0..6 {
        f.source.push(0, order(n));
        f.source.push(1, order(100 + n));
    }
    f.source.close();
    f.store.fail_next(1);
    f.sink.fail_next(1);

    let (consumer, _shutdown) = f.consumer(fast_redelivery());
    assert_ok!(consumer.run().await);

    assert_eq!(f.source.acknowledged_offsets(0), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(f.source.acknowledged_offsets(1), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(f.sink.len(), 12);
}

#[tokio::test]
async fn redelivery_bumps_attempt_until_budget_is_spent() {
    let f = Fixture::new();
    f.sink.fail_next(usize::MAX);
    let delivery = f.source.push(3, order(1));
    f.source.close();

    let (consumer, _shutdown) = f.consumer(
        RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .build(),
    );
    assert_ok!(consumer.run().await);

    // One attempt plus two redeliveries, each storing a record.
    assert_eq!(f.store.len(), 3);
    assert!(f.sink.is_empty());

    let dead = f.dead_letters.entries();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].0.metadata.attempt, 3);
    assert!(dead[0].1.contains("redelivery budget exhausted"));
    assert_eq!(f.source.acknowledged(), vec![delivery]);
}

#[tokio::test]
async fn in_flight_delivery_finishes_on_shutdown() {
    let f = Fixture::new();
    f.store.set_latency(Some(Duration::from_millis(150)));
    for n in 0..3 {
        f.source.push(0, order(n));
    }

    let (consumer, shutdown) = f.consumer(fast_redelivery());
    let running = tokio::spawn(consumer.run());

    let store = f.store.clone();
    assert!(eventually(Duration::from_secs(5), || store.attempts() == 1).await);
    shutdown.send(true).unwrap();
    running.await.unwrap().unwrap();

    assert_eq!(f.store.len(), 1);
    assert_eq!(f.sink.len(), 1);
    assert_eq!(f.source.acknowledged_offsets(0), vec![0]);
}

#[tokio::test]
async fn shutdown_during_backoff_leaves_delivery_unacknowledged() {
    let f = Fixture::new();
    f.store.fail_next(usize::MAX);
    f.source.push(0, order(1));

    let (consumer, shutdown) = f.consumer(
        RetryPolicy::builder()
            .initial_delay(Duration::from_secs(60))
            .max_delay(Duration::from_secs(60))
            .build(),
    );
    let running = tokio::spawn(consumer.run());

    let store = f.store.clone();
    assert!(eventually(Duration::from_secs(5), || store.attempts() == 1).await);
    let started = Instant::now();
    shutdown.send(true).unwrap();
    running.await.unwrap().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(f.source.ack_count(), 0);
    assert!(f.dead_letters.is_empty());
}

#[tokio::test]
async fn drain_timeout_bounds_shutdown() {
    let f = Fixture::new();
    f.store.set_latency(Some(Duration::from_secs(60)));
    f.source.push(0, order(1));

    let engine = Arc::new(
        RelayEngine::new(f.store.clone(), f.sink.clone())
            .with_store_timeout(Duration::from_secs(120)),
    );
    let (consumer, shutdown) = RelayConsumer::new(engine, f.source.clone());
    let consumer = consumer.with_drain_timeout(Duration::from_millis(50));
    let running = tokio::spawn(consumer.run());

    let store = f.store.clone();
    assert!(eventually(Duration::from_secs(5), || store.attempts() == 1).await);
    shutdown.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("drain should be bounded")
        .unwrap()
        .unwrap();
    assert_eq!(f.source.ack_count(), 0);
}

#[tokio::test]
async fn failed_acknowledgment_does_not_stop_the_shard() {
    let f = Fixture::new();
    f.source.fail_next_acks(1);
    f.source.push(0, order(1));
    f.source.push(0, order(2));
    f.source.close();

    let (consumer, _shutdown) = f.consumer(fast_redelivery());
    assert_ok!(consumer.run().await);

    assert_eq!(f.store.len(), 2);
    assert_eq!(f.source.acknowledged_offsets(0), vec![1]);
}

#[tokio::test]
async fn failed_dead_letter_still_drops_malformed_delivery() {
    let f = Fixture::new();
    f.dead_letters.fail_next(1);
    let delivery = f.source.push(0, b"{\"orderId\": 42}".to_vec());
    f.source.close();

    let (consumer, _shutdown) = f.consumer(fast_redelivery());
    assert_ok!(consumer.run().await);

    assert!(f.dead_letters.is_empty());
    assert_eq!(f.source.acknowledged(), vec![delivery]);
    assert_eq!(f.store.attempts(), 0);
}

#[tokio::test]
async fn second_subscription_fails() {
    let f = Fixture::new();
    f.source.close();
    let (first, _a) = f.consumer(fast_redelivery());
    assert_ok!(first.run().await);

    let (second, _b) = f.consumer(fast_redelivery());
    assert_err!(second.run().await);
}

#[tokio::test]
async fn stalled_shard_does_not_hold_up_other_shards() {
    let f = Fixture::new();
    f.store.fail_order(Uuid::from_u128(1));
    for _ in 0..4 {
        f.source.push(0, order(1));
    }
    f.source.push(1, order(2));

    let (consumer, shutdown) = f.consumer(fast_redelivery());
    let running = tokio::spawn(consumer.with_shard_buffer(1).run());

    let source = f.source.clone();
    assert!(
        eventually(Duration::from_secs(2), || source.acknowledged_offsets(1) == vec![0]).await,
        "shard 1 should be acknowledged while shard 0 keeps redelivering"
    );
    assert_eq!(f.store.len(), 1);
    assert_eq!(f.store.records()[0].order_id, Uuid::from_u128(2));

    shutdown.send(true).unwrap();
    running.await.unwrap().unwrap();
    assert!(f.source.acknowledged_offsets(0).is_empty());
}

#[tokio::test]
async fn exhausted_delivery_stays_unacknowledged_when_dead_letter_fails() {
    let f = Fixture::new();
    f.store.fail_order(Uuid::from_u128(1));
    f.dead_letters.fail_next(1);
    f.source.push(0, order(1));
    f.source.push(0, order(2));
    f.source.push(1, order(3));
    f.source.close();

    let (consumer, _shutdown) = f.consumer(
        RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(1))
            .build(),
    );
    assert_ok!(consumer.run().await);

    assert!(f.dead_letters.is_empty());
    // Nothing on shard 0 is committed past the stalled delivery.
    assert!(f.source.acknowledged_offsets(0).is_empty());
    assert_eq!(f.source.acknowledged_offsets(1), vec![0]);
    assert_eq!(f.store.len(), 1);
    assert_eq!(f.sink.len(), 1);
}

#[tokio::test]
async fn exhausted_delivery_stays_unacknowledged_without_dead_letter_sink() {
    let f = Fixture::new();
    f.store.fail_next(usize::MAX);
    f.source.push(0, order(1));
    f.source.close();

    let engine = Arc::new(RelayEngine::new(f.store.clone(), f.sink.clone()));
    let (consumer, _shutdown) = RelayConsumer::new(engine, f.source.clone());
    let consumer = consumer.with_redelivery_policy(
        RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .build(),
    );
    assert_ok!(consumer.run().await);

    assert_eq!(f.store.attempts(), 3);
    assert_eq!(f.source.ack_count(), 0);
}
