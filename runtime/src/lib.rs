//! # Order Relay Runtime
//!
//! The relay engine and the consumption loop that drives it.
//!
//! ## Core Components
//!
//! - **[`RelayEngine`]**: validates an event, persists the derived record, then
//!   publishes the forwarded message, each step under its own timeout
//! - **[`RelayConsumer`]**: one worker per shard, acknowledgment after success,
//!   dead-lettering of malformed input, backoff-paced redelivery, graceful drain
//! - **[`RetryPolicy`](retry::RetryPolicy)**: exponential backoff shared by
//!   redelivery and startup connection retries
//! - **[`metrics`]**: Prometheus counters and histograms for every outcome
//!
//! ## Example
//!
//! ```ignore
//! use order_relay_runtime::{RelayConsumer, RelayEngine};
//!
//! let engine = Arc::new(RelayEngine::new(store, sink));
//! let (consumer, shutdown) = RelayConsumer::new(engine, source);
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown.send(true).ok();
//! });
//!
//! consumer.run().await?;
//! ```

/// Per-event relay cycle
pub mod engine;

/// Shard-ordered consumption loop with redelivery and drain
pub mod consumer;

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

pub use consumer::RelayConsumer;
pub use engine::{RelayEngine, RelayReceipt};
pub use retry::RetryPolicy;
