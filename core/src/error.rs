//! Relay error taxonomy and the broker disposition each error implies.

use crate::record_store::StoreError;
use crate::stream_sink::PublishError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Step of the relay cycle that talks to an external system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayStep {
    /// Writing the persisted record to the record store
    Persist,
    /// Publishing the forwarded message to the stream sink
    Publish,
}

impl RelayStep {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Persist => "persist",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for RelayStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the consumption loop must do with a delivery after a relay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Both writes succeeded; acknowledge the delivery
    Acknowledge,
    /// A transient failure; leave the delivery unacknowledged so it is redelivered
    Redeliver,
    /// The payload can never succeed; dead-letter and acknowledge it
    Reject,
}

/// Errors produced by a relay cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The inbound payload failed structural validation
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// The record store rejected or failed the insert
    #[error("Store write failed: {0}")]
    StoreWriteFailed(#[from] StoreError),

    /// The stream sink failed to publish the forwarded message
    #[error("Publish failed: {0}")]
    PublishFailed(#[from] PublishError),

    /// An external step exceeded its bound
    #[error("{step} step timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// The step that timed out
        step: RelayStep,
        /// The bound that was exceeded
        timeout: Duration,
    },
}

impl RelayError {
    /// The broker-facing consequence of this error.
    ///
    /// Only malformed input is rejected; store, publish and timeout failures
    /// are all redelivered.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::MalformedEvent(_) => Disposition::Reject,
            Self::StoreWriteFailed(_) | Self::PublishFailed(_) | Self::Timeout { .. } => {
                Disposition::Redeliver
            },
        }
    }

    /// Whether a redelivery of the same payload may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.disposition(), Disposition::Redeliver)
    }

    /// The external step this error belongs to, if any.
    #[must_use]
    pub const fn step(&self) -> Option<RelayStep> {
        match self {
            Self::MalformedEvent(_) => None,
            Self::StoreWriteFailed(_) => Some(RelayStep::Persist),
            Self::PublishFailed(_) => Some(RelayStep::Publish),
            Self::Timeout { step, .. } => Some(*step),
        }
    }

    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEvent(_) => "malformed_event",
            Self::StoreWriteFailed(_) => "store_write_failed",
            Self::PublishFailed(_) => "publish_failed",
            Self::Timeout { .. } => "timeout",
        }
    }
}
