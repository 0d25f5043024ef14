//! Error types for the processor core.
//!
//! One enum covers every failure the processor can observe or deliver
//! downstream. Transient transport conditions are recovered inside the
//! sender's retry loop and only surface here once the linger bound expires;
//! everything else is terminal for the signal or the processor.

use std::time::Duration;

use riffle_ipc::{ManagerError, TransportError};
use riffle_proto::ProtocolError;
use thiserror::Error;

/// Errors observed by the processor and delivered to subscribers.
///
/// `Clone` because a terminal is fanned out to every downstream entry.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// An inbound frame failed to decode. Recoverable: the frame is
    /// discarded and the stream continues.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] ProtocolError),

    /// The outbound publication was closed under the sender.
    #[error("publication closed")]
    PublicationClosed,

    /// Back-pressure persisted past the linger bound.
    #[error("publication back-pressured for {elapsed:?}")]
    Backpressured {
        /// How long the sender retried before giving up.
        elapsed: Duration,
    },

    /// The publication has no connected subscriber image. Transient while
    /// live sessions remain.
    #[error("publication not connected")]
    NotConnected,

    /// No heartbeat reply arrived within the liveness bound.
    #[error("transport timeout: no heartbeat reply within {timeout:?}")]
    TransportTimeout {
        /// The configured liveness bound.
        timeout: Duration,
    },

    /// A frame was dropped because every remote session left.
    #[error("no live subscriber sessions")]
    NoSubscribers,

    /// The driver manager is mid-shutdown; the transport cannot be acquired.
    #[error("driver manager is shutting down")]
    ManagerShuttingDown,

    /// The peer or a local caller broke the protocol (unknown session,
    /// unsolicited reply, concurrent signals in `create` mode).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An error carried in a peer's Error frame, rendered as text.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The outbound stream's position space is exhausted.
    #[error("stream position space exhausted")]
    MaxPositionExceeded,

    /// The context failed validation.
    #[error("invalid context: {0}")]
    Config(String),

    /// The embedded driver failed.
    #[error("driver: {0}")]
    Driver(String),
}

impl CoreError {
    /// Whether the condition may clear on retry. Only raw back-pressure and
    /// a missing subscriber image qualify; protocol violations and closed
    /// handles never do.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backpressured { .. } | Self::NotConnected)
    }
}

impl From<ManagerError> for CoreError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::ShuttingDown => Self::ManagerShuttingDown,
            ManagerError::Transport(e) => Self::Driver(e.to_string()),
        }
    }
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        Self::Driver(err.to_string())
    }
}
