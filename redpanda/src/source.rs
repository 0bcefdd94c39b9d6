//! Delivery source consuming inbound order events.

use chrono::Utc;
use futures::StreamExt;
use order_relay_core::delivery::{
    Delivery, DeliveryMetadata, DeliverySource, DeliveryStream, SourceError,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

/// Topic used when none is configured.
pub const DEFAULT_TOPIC: &str = "order-created";

/// Consumer group used when none is configured.
pub const DEFAULT_CONSUMER_GROUP: &str = "analytics-processor";

/// Kafka consumer implementing [`DeliverySource`].
///
/// Auto-commit is disabled. Offsets move only through
/// [`DeliverySource::acknowledge`], which commits `offset + 1` for the
/// delivery's partition. Acknowledgments must arrive in offset order per
/// partition, which the relay consumer guarantees by running one worker per
/// shard.
///
/// A source subscribes once; a second [`DeliverySource::subscribe`] fails.
pub struct RedpandaDeliverySource {
    brokers: String,
    topic: String,
    consumer_group: String,
    auto_offset_reset: String,
    buffer_size: usize,
    config: Vec<(String, String)>,
    consumer: OnceLock<Arc<StreamConsumer>>,
}

impl RedpandaDeliverySource {
    /// Create a new builder for configuring the source.
    #[must_use]
    pub fn builder() -> RedpandaDeliverySourceBuilder {
        RedpandaDeliverySourceBuilder::default()
    }

    /// Topic this source consumes.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group this source joins.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn subscription_failed(&self, reason: impl Into<String>) -> SourceError {
        SourceError::SubscriptionFailed {
            topic: self.topic.clone(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Debug for RedpandaDeliverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaDeliverySource")
            .field("brokers", &self.brokers)
            .field("topic", &self.topic)
            .field("consumer_group", &self.consumer_group)
            .field("subscribed", &self.consumer.get().is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RedpandaDeliverySource`].
#[derive(Default)]
pub struct RedpandaDeliverySourceBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    buffer_size: Option<usize>,
    config: Vec<(String, String)>,
}

impl RedpandaDeliverySourceBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the topic to consume.
    ///
    /// Default: `order-created`
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group ID.
    ///
    /// Instances sharing a group split the topic's partitions between them.
    ///
    /// Default: `analytics-processor`
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set where a new consumer group starts reading: `"earliest"`, `"latest"` or `"error"`.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set how many received deliveries may wait between the Kafka consumer
    /// and the relay. Zero is treated as one.
    ///
    /// Default: 1000
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Pass an arbitrary librdkafka property through, e.g. `security.protocol`.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.push((key.into(), value.into()));
        self
    }

    /// Build the [`RedpandaDeliverySource`].
    ///
    /// The Kafka consumer itself is created on subscribe.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ConnectionFailed`] if brokers are not set.
    pub fn build(self) -> Result<RedpandaDeliverySource, SourceError> {
        let brokers = self
            .brokers
            .ok_or_else(|| SourceError::ConnectionFailed("Brokers not configured".to_string()))?;

        Ok(RedpandaDeliverySource {
            brokers,
            topic: self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            buffer_size: self.buffer_size.unwrap_or(1000),
            config: self.config,
            consumer: OnceLock::new(),
        })
    }
}

impl DeliverySource for RedpandaDeliverySource {
    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, SourceError>> + Send + '_>> {
        Box::pin(async move {
            if self.consumer.get().is_some() {
                return Err(self.subscription_failed("Already subscribed"));
            }

            let mut consumer_config = ClientConfig::new();
            consumer_config
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false");
            for (key, value) in &self.config {
                consumer_config.set(key, value);
            }

            let consumer: StreamConsumer = consumer_config
                .create()
                .map_err(|e| self.subscription_failed(format!("Failed to create consumer: {e}")))?;
            consumer
                .subscribe(&[self.topic.as_str()])
                .map_err(|e| self.subscription_failed(format!("Failed to subscribe: {e}")))?;

            let consumer = Arc::new(consumer);
            if self.consumer.set(Arc::clone(&consumer)).is_err() {
                return Err(self.subscription_failed("Already subscribed"));
            }

            tracing::info!(
                topic = %self.topic,
                consumer_group = %self.consumer_group,
                buffer_size = self.buffer_size,
                auto_offset_reset = %self.auto_offset_reset,
                manual_commit = true,
                "Subscribed to topic"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(self.buffer_size);

            // The forwarder owns a handle to the consumer and stops as soon as
            // the relay drops the stream. Nothing is committed here.
            tokio::spawn(async move {
                let mut messages = consumer.stream();
                loop {
                    let next = tokio::select! {
                        () = tx.closed() => break,
                        next = messages.next() => next,
                    };
                    let Some(result) = next else { break };

                    let item = match result {
                        Ok(message) => {
                            let delivery = to_delivery(&message);
                            tracing::trace!(
                                event_id = %delivery.metadata.event_id,
                                partition = delivery.metadata.shard,
                                offset = delivery.metadata.offset,
                                "Received delivery"
                            );
                            Ok(delivery)
                        },
                        Err(e) => Err(SourceError::TransportError(format!(
                            "Failed to receive message: {e}"
                        ))),
                    };

                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                tracing::debug!("Delivery forwarder exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    yield item;
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
            let commit_failed = |reason: String| SourceError::CommitFailed {
                shard: metadata.shard,
                offset: metadata.offset,
                reason,
            };

            let consumer = self
                .consumer
                .get()
                .ok_or_else(|| commit_failed("Not subscribed".to_string()))?;

            let mut offsets = TopicPartitionList::new();
            offsets
                .add_partition_offset(
                    &metadata.topic,
                    metadata.shard,
                    Offset::Offset(metadata.offset + 1),
                )
                .map_err(|e| commit_failed(e.to_string()))?;
            consumer
                .commit(&offsets, CommitMode::Async)
                .map_err(|e| commit_failed(e.to_string()))?;

            tracing::trace!(
                event_id = %metadata.event_id,
                partition = metadata.shard,
                offset = metadata.offset,
                "Offset committed"
            );
            Ok(())
        })
    }
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    let header_id = message.headers().and_then(|headers| {
        headers
            .iter()
            .find(|header| is_message_id_header(header.key))
            .and_then(|header| header.value)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    });

    Delivery {
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        metadata: DeliveryMetadata {
            event_id: resolve_event_id(
                header_id,
                message.topic(),
                message.partition(),
                message.offset(),
            ),
            topic: message.topic().to_string(),
            shard: message.partition(),
            offset: message.offset(),
            attempt: 1,
            received_at: Utc::now(),
        },
    }
}

fn is_message_id_header(key: &str) -> bool {
    key.eq_ignore_ascii_case("message-id") || key.eq_ignore_ascii_case("messageid")
}

/// Producer-assigned id if present, otherwise the delivery's log coordinates.
fn resolve_event_id(header_id: Option<String>, topic: &str, partition: i32, offset: i64) -> String {
    header_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("{topic}-{partition}-{offset}"))
}
