//! Kafka-compatible adapters for the order analytics relay.
//!
//! Two adapters share one client library (rdkafka):
//!
//! - [`RedpandaDeliverySource`] consumes `order-created` events with manual
//!   offset commits, so a delivery is only consumed once the relay acknowledges it
//! - [`RedpandaStreamSink`] publishes forwarded messages to `stream-analytics`,
//!   keyed by analytics id, without producer-side retries
//!
//! Both work against Redpanda, Apache Kafka or any broker speaking the Kafka
//! protocol.
//!
//! # Delivery Semantics
//!
//! **At-least-once** end to end:
//! - the source commits `offset + 1` only when [`DeliverySource::acknowledge`] is called
//! - a crash before that commit means the broker redelivers after restart
//! - ordering holds within a partition, which the relay maps to a shard
//!
//! # Example
//!
//! ```no_run
//! use order_relay_redpanda::{RedpandaDeliverySource, RedpandaStreamSink};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = RedpandaDeliverySource::builder()
//!     .brokers("localhost:9092")
//!     .topic("order-created")
//!     .consumer_group("analytics-processor")
//!     .build()?;
//!
//! let sink = RedpandaStreamSink::builder()
//!     .brokers("localhost:9092")
//!     .topic("stream-analytics")
//!     .producer_acks("all")
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! [`DeliverySource::acknowledge`]: order_relay_core::delivery::DeliverySource::acknowledge

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sink;
pub mod source;

pub use sink::{RedpandaStreamSink, RedpandaStreamSinkBuilder};
pub use source::{RedpandaDeliverySource, RedpandaDeliverySourceBuilder};
