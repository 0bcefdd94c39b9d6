//! Stream sink publishing forwarded messages.

use order_relay_core::record::ForwardedMessage;
use order_relay_core::stream_sink::{PublishAck, PublishError, StreamSink};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Topic used when none is configured.
pub const DEFAULT_TOPIC: &str = "stream-analytics";

/// Kafka producer implementing [`StreamSink`].
///
/// Each publish waits for the broker's delivery report. The producer never
/// retries on its own (`message.send.max.retries = 0`); a failed send is
/// reported back so the relay can leave the inbound delivery unacknowledged.
///
/// # Example
///
/// ```no_run
/// use order_relay_redpanda::RedpandaStreamSink;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let sink = RedpandaStreamSink::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(5))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaStreamSink {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl RedpandaStreamSink {
    /// Create a sink for `brokers` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, PublishError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the sink.
    #[must_use]
    pub fn builder() -> RedpandaStreamSinkBuilder {
        RedpandaStreamSinkBuilder::default()
    }

    /// Topic messages are published to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl std::fmt::Debug for RedpandaStreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaStreamSink")
            .field("topic", &self.topic)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RedpandaStreamSink`].
#[derive(Default)]
pub struct RedpandaStreamSinkBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    config: Vec<(String, String)>,
}

impl RedpandaStreamSinkBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the destination topic.
    ///
    /// Default: `stream-analytics`
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set how long a publish may wait for the broker's delivery report.
    ///
    /// Also used as `message.timeout.ms`, so librdkafka gives up on the
    /// message at the same moment the caller stops waiting.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pass an arbitrary librdkafka property through, e.g. SASL settings.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.push((key.into(), value.into()));
        self
    }

    /// Build the [`RedpandaStreamSink`].
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::ConnectionFailed`] if brokers are not set or the
    /// configuration is rejected by librdkafka.
    pub fn build(self) -> Result<RedpandaStreamSink, PublishError> {
        let brokers = self
            .brokers
            .ok_or_else(|| PublishError::ConnectionFailed("Brokers not configured".to_string()))?;
        let topic = self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("acks", acks)
            .set("compression.type", compression)
            .set("message.send.max.retries", "0")
            .set("message.timeout.ms", timeout.as_millis().max(1).to_string());
        for (key, value) in &self.config {
            producer_config.set(key, value);
        }

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            PublishError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            acks = acks,
            compression = compression,
            timeout_ms = timeout.as_millis(),
            "RedpandaStreamSink created"
        );

        Ok(RedpandaStreamSink {
            producer,
            topic,
            timeout,
        })
    }
}

impl StreamSink for RedpandaStreamSink {
    fn publish(
        &self,
        message: &ForwardedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, PublishError>> + Send + '_>> {
        let encoded = message.to_json();
        let key = message.key();

        Box::pin(async move {
            let payload = encoded?;
            let headers = OwnedHeaders::new().insert(Header {
                key: "content-type",
                value: Some("application/json"),
            });
            let record = FutureRecord::to(&self.topic)
                .payload(&payload)
                .key(key.as_str())
                .headers(headers);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %self.topic,
                        partition = partition,
                        offset = offset,
                        analytics_id = %key,
                        "Forwarded message published"
                    );
                    Ok(PublishAck {
                        topic: self.topic.clone(),
                        partition,
                        offset,
                    })
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %self.topic,
                        analytics_id = %key,
                        error = %kafka_error,
                        "Failed to publish forwarded message"
                    );
                    Err(PublishError::PublishFailed {
                        topic: self.topic.clone(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| PublishError::PublishFailed {
                topic: self.topic.clone(),
                reason: format!("Flush failed: {e}"),
            })
    }
}
