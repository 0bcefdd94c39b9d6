//! Integration tests for the Kafka adapters against a real broker.
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p order-relay-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use order_relay_core::delivery::{Delivery, DeliverySource, DeliveryStream};
use order_relay_core::record::{ForwardedMessage, ProcessingStatus};
use order_relay_core::stream_sink::StreamSink;
use order_relay_redpanda::{RedpandaDeliverySource, RedpandaStreamSink};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rust_decimal::Decimal;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};
use tokio_test::assert_ok;
use uuid::Uuid;

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    wait_for_kafka_ready(&brokers).await;
    (kafka, brokers)
}

/// Publish warmup messages until the broker accepts one.
async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if produce(brokers, "warmup-topic", None, b"warmup").await.is_ok() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

async fn produce(
    brokers: &str,
    topic: &str,
    message_id: Option<&str>,
    payload: &[u8],
) -> Result<(), String> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()
        .map_err(|e| e.to_string())?;

    let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
    if let Some(id) = message_id {
        record = record.headers(OwnedHeaders::new().insert(Header {
            key: "message-id",
            value: Some(id),
        }));
    }
    producer
        .send(record, Timeout::After(Duration::from_secs(5)))
        .await
        .map(|_| ())
        .map_err(|(e, _)| e.to_string())
}

fn source(brokers: &str, topic: &str, group: &str) -> RedpandaDeliverySource {
    RedpandaDeliverySource::builder()
        .brokers(brokers)
        .topic(topic)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to build source")
}

async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Stream ended")
        .expect("Transport error")
}

#[tokio::test]
#[ignore]
async fn test_sink_publishes_keyed_json() {
    let (_kafka, brokers) = start_kafka().await;

    let sink = RedpandaStreamSink::builder()
        .brokers(&brokers)
        .topic("stream-analytics")
        .producer_acks("all")
        .build()
        .expect("Failed to build sink");

    let message = ForwardedMessage {
        analytics_id: Uuid::new_v4(),
        order_id: Uuid::new_v4(),
        customer_name: "Alice".to_string(),
        total_amount: Decimal::new(10000, 2),
        processed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        processing_status: ProcessingStatus::Processed,
    };

    let ack = sink.publish(&message).await.expect("Publish should succeed");
    assert_eq!(ack.topic, "stream-analytics");
    assert!(ack.offset >= 0);
    sink.flush(Duration::from_secs(5)).expect("Flush should succeed");

    let reader = source(&brokers, "stream-analytics", "sink-test-reader");
    let mut stream = reader.subscribe().await.expect("Failed to subscribe");
    let delivery = next_delivery(&mut stream).await;

    let json: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
    assert_eq!(json["AnalyticsId"], message.analytics_id.to_string());
    assert_eq!(json["CustomerName"], "Alice");
    assert!(json["TotalAmount"].is_number());
    assert_eq!(json["TotalAmount"].to_string(), "100.00");
    assert_eq!(delivery.metadata.shard, ack.partition);
    assert_eq!(delivery.metadata.offset, ack.offset);
}

#[tokio::test]
#[ignore]
async fn test_source_reads_message_id_header() {
    let (_kafka, brokers) = start_kafka().await;

    produce(&brokers, "order-created", Some("evt-42"), b"{}")
        .await
        .expect("Failed to produce");
    produce(&brokers, "order-created", None, b"{}")
        .await
        .expect("Failed to produce");

    let relay = source(&brokers, "order-created", "header-test");
    let mut stream = relay.subscribe().await.expect("Failed to subscribe");

    let first = next_delivery(&mut stream).await;
    let second = next_delivery(&mut stream).await;
    assert_eq!(first.metadata.event_id, "evt-42");
    assert_eq!(first.metadata.attempt, 1);
    assert_eq!(
        second.metadata.event_id,
        format!("order-created-{}-{}", second.metadata.shard, second.metadata.offset)
    );

    assert!(relay.subscribe().await.is_err(), "second subscribe must fail");
}

#[tokio::test]
#[ignore]
async fn test_only_unacknowledged_deliveries_come_back() {
    let (_kafka, brokers) = start_kafka().await;

    produce(&brokers, "order-created", Some("acked"), b"one")
        .await
        .expect("Failed to produce");
    produce(&brokers, "order-created", Some("pending"), b"two")
        .await
        .expect("Failed to produce");

    {
        let relay = source(&brokers, "order-created", "restart-test");
        let mut stream = relay.subscribe().await.expect("Failed to subscribe");
        let first = next_delivery(&mut stream).await;
        let _second = next_delivery(&mut stream).await;
        assert_eq!(first.metadata.event_id, "acked");

        assert_ok!(relay.acknowledge(&first.metadata).await);
        // Async commit; give it time to reach the broker before leaving the group.
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    // Same group after a restart: committed offset is past the first message.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let restarted = source(&brokers, "order-created", "restart-test");
    let mut stream = restarted.subscribe().await.expect("Failed to subscribe");
    let redelivered = next_delivery(&mut stream).await;
    assert_eq!(redelivered.metadata.event_id, "pending");
    assert_eq!(redelivered.payload, b"two");
}
