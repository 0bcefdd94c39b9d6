//! # Order Relay Testing
//!
//! Testing utilities for the order analytics relay.
//!
//! This crate provides:
//! - Deterministic environment implementations ([`FixedClock`], [`SequentialIdGenerator`])
//! - In-memory adapters with failure and latency injection
//! - A shared [`Journal`] that records the order of store writes, publishes and
//!   acknowledgments across adapters
//! - proptest strategies and payload builders for inbound events
//!
//! ## Example
//!
//! ```ignore
//! use order_relay_testing::{InMemoryRecordStore, InMemoryStreamSink, Journal};
//!
//! #[tokio::test]
//! async fn relays_one_event() {
//!     let journal = Journal::new();
//!     let store = Arc::new(InMemoryRecordStore::new().with_journal(journal.clone()));
//!     let sink = Arc::new(InMemoryStreamSink::new().with_journal(journal.clone()));
//!     let engine = RelayEngine::new(store.clone(), sink.clone());
//!
//!     engine.handle_payload(&order_created_json(...)).await.unwrap();
//!     assert_eq!(journal.entries().len(), 2);
//! }
//! ```

use chrono::{DateTime, Utc};
use order_relay_core::environment::{Clock, IdGenerator};
use uuid::Uuid;

pub mod adapters;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, IdGenerator, Utc, Uuid};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use order_relay_testing::mocks::FixedClock;
    /// use order_relay_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Id generator yielding `00000000-…-0001`, `…-0002`, and so on.
    #[derive(Debug, Default)]
    pub struct SequentialIdGenerator {
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Start at 1
        #[must_use]
        pub const fn new() -> Self {
            Self {
                next: AtomicU64::new(0),
            }
        }

        /// Number of ids handed out so far
        #[must_use]
        pub fn issued(&self) -> u64 {
            self.next.load(Ordering::SeqCst)
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn next_id(&self) -> Uuid {
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            Uuid::from_u128(u128::from(n))
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use std::time::Duration;

    /// JSON body of an `OrderCreated` event, as the order service publishes it.
    #[must_use]
    pub fn order_created_json(
        order_id: &str,
        customer_name: &str,
        total_amount: &str,
        created_at: &str,
    ) -> Vec<u8> {
        serde_json::json!({
            "orderId": order_id,
            "customerName": customer_name,
            "totalAmount": total_amount,
            "createdAt": created_at,
        })
        .to_string()
        .into_bytes()
    }

    /// Poll `condition` every few milliseconds until it holds or `timeout`
    /// elapses. Returns whether it held.
    pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Install a test-friendly `tracing` subscriber.
    ///
    /// Safe to call from every test; only the first call installs it.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use chrono::{TimeZone, Utc};
    use order_relay_core::event::InboundEvent;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    /// Strategy for valid inbound events.
    pub fn arb_inbound_event() -> impl Strategy<Value = InboundEvent> {
        (
            any::<u128>(),
            "[A-Za-z][A-Za-z .'\\-]{0,30}",
            0i64..1_000_000_000,
            0u32..4,
            0i64..4_102_444_800,
        )
            .prop_filter_map("timestamp in range", |(order, name, units, scale, secs)| {
                Utc.timestamp_opt(secs, 0)
                    .single()
                    .map(|created_at| InboundEvent {
                        order_id: Uuid::from_u128(order),
                        customer_name: name,
                        total_amount: Decimal::new(units, scale),
                        created_at,
                    })
            })
    }
}

// Re-export commonly used items
pub use adapters::{
    CapturedMessage, InMemoryDeadLetterSink, InMemoryDeliverySource, InMemoryRecordStore,
    InMemoryStreamSink, Journal, JournalEntry,
};
pub use helpers::{eventually, init_test_tracing, order_created_json};
pub use mocks::{FixedClock, SequentialIdGenerator, test_clock};
