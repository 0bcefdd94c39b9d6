//! # Order Relay Core
//!
//! Core types and adapter traits for the order analytics relay.
//!
//! The relay consumes `OrderCreated` events from a broker, persists a derived
//! analytics record, and forwards a copy of that record onto a stream:
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Event Source │ ──▶ │ Relay Engine │ ──▶ │ Record Store │     │ Stream Sink  │
//! │   (broker)   │     │              │ ──────────────────────▶ │   (Kafka)    │
//! └──────────────┘     └──────┬───────┘     └──────────────┘     └──────────────┘
//!        ▲                    │
//!        └──── acknowledge ───┘  (only after persist AND publish succeed)
//! ```
//!
//! ## Core Concepts
//!
//! - **[`InboundEvent`](event::InboundEvent)**: the decoded broker payload
//! - **[`PersistedRecord`](record::PersistedRecord)**: the derived fact written to the store
//! - **[`ForwardedMessage`](record::ForwardedMessage)**: the 1:1 projection of a record onto the stream
//! - **[`RecordStore`](record_store::RecordStore)** / **[`StreamSink`](stream_sink::StreamSink)**:
//!   the two external back ends, which share no transaction
//! - **[`DeliverySource`](delivery::DeliverySource)**: the broker side, with explicit acknowledgment
//!
//! ## Delivery Guarantees
//!
//! - **Persist before publish**: a message is never forwarded for a record that might not exist
//! - **At-least-once**: a failed cycle is redelivered and produces a fresh record id
//! - **No acknowledgment on partial failure**: the broker keeps the delivery until both writes succeed

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;

pub mod delivery;
pub mod error;
pub mod event;
pub mod record;
pub mod record_store;
pub mod stream_sink;

/// Environment module - injected dependencies
///
/// Time and identifier generation are abstracted behind traits so the relay
/// can be driven deterministically in tests.
pub mod environment {
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// let clock = SystemClock;
    ///
    /// // Test - fixed time for deterministic tests
    /// let clock = FixedClock::new(time);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of record identifiers.
    ///
    /// Every processing attempt asks for a new id; identifiers are never taken
    /// from the inbound event.
    pub trait IdGenerator: Send + Sync {
        /// Produce the next record identifier
        fn next_id(&self) -> Uuid;
    }

    /// Random (v4) UUID generator used in production.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct RandomIdGenerator;

    impl IdGenerator for RandomIdGenerator {
        fn next_id(&self) -> Uuid {
            Uuid::new_v4()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{IdGenerator, RandomIdGenerator};

    #[test]
    fn random_ids_are_distinct() {
        let ids = RandomIdGenerator;
        assert_ne!(ids.next_id(), ids.next_id());
    }
}
