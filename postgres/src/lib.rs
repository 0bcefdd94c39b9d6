//! `PostgreSQL` adapters for the order analytics relay.
//!
//! This crate provides:
//!
//! - [`PostgresRecordStore`]: the system of record, one row per processing attempt
//! - [`PostgresDeadLetterQueue`]: rejected deliveries, kept for investigation
//! - [`connect_pool`]: a bounded connection pool shared by both
//!
//! Tables are expected to exist; this crate does not run migrations.
//!
//! # Example
//!
//! ```ignore
//! use order_relay_postgres::{PostgresRecordStore, connect_pool};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect_pool("postgres://localhost/analytics", 10, Duration::from_secs(30)).await?;
//!     let store = PostgresRecordStore::new(pool).with_table("analytics_records")?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;
pub mod record_store;

pub use dead_letter_queue::{DLQStatus, FailedDelivery, PostgresDeadLetterQueue};
pub use record_store::{DEFAULT_TABLE, PostgresRecordStore, connect_pool};
