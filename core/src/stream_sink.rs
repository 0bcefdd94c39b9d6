//! Streaming channel abstraction.
//!
//! A [`StreamSink`] appends [`ForwardedMessage`]s to a partitioned log. The
//! returned [`PublishAck`] carries the partition and offset for logging only;
//! nothing downstream depends on it.
//!
//! Implementations do not retry internally. A failed publish is reported to the
//! relay engine, which leaves the inbound delivery unacknowledged so the whole
//! cycle is redelivered.

use crate::record::ForwardedMessage;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Position of a published message in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Topic the message was appended to
    pub topic: String,
    /// Partition the message landed on
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

/// Errors that can occur while publishing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Failed to create or reach the producer
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker did not accept the message
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// The message could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Append-only sink for forwarded messages.
pub trait StreamSink: Send + Sync {
    /// Publish one message keyed by its analytics id.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the broker does not confirm the write.
    fn publish(
        &self,
        message: &ForwardedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, PublishError>> + Send + '_>>;

    /// Drain buffered messages before shutdown.
    ///
    /// The default does nothing, for sinks that never buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the buffer could not be drained in time.
    fn flush(&self, _timeout: Duration) -> Result<(), PublishError> {
        Ok(())
    }
}
