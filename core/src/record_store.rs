//! System-of-record abstraction.
//!
//! The [`RecordStore`] is an insert-only sink for [`PersistedRecord`]s. Each
//! insert is a single atomic row write; there is no cross-record locking and
//! no deduplication. A redelivered event produces a second record with a new
//! id, and the store accepts it.
//!
//! # Implementations
//!
//! - `InMemoryRecordStore` (in `order-relay-testing`) - failure injection for tests
//! - `PostgresRecordStore` (in `order-relay-postgres`) - production

use crate::record::PersistedRecord;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while writing to the record store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The store rejected or failed the statement
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A record with the same id already exists
    #[error("Duplicate record id: {0}")]
    DuplicateRecord(Uuid),
}

/// Insert-only store of analytics records.
///
/// Implementations must be `Send + Sync`; a single store handle is shared by
/// every shard worker.
pub trait RecordStore: Send + Sync {
    /// Durably insert one record.
    ///
    /// Returns once the row is committed. The write is all-or-nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the row could not be committed.
    fn insert(
        &self,
        record: &PersistedRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}
