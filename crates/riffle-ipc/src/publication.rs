//! Exclusive writer view over one stream.

use std::sync::Arc;

use crate::driver::MediaDriver;

/// Outcome of a non-blocking [`Publication::offer`].
///
/// `Backpressured`, `NotConnected` and `AdminAction` are transient: callers
/// retry after a pause. `Closed` and `MaxPositionExceeded` are terminal for
/// the publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The frame was accepted; the stream position after the write.
    Position(u64),
    /// The slowest subscriber's in-flight window is full.
    Backpressured,
    /// No subscriber is attached to the stream.
    NotConnected,
    /// The driver is reorganizing the stream; retry shortly.
    AdminAction,
    /// The publication or driver was closed.
    Closed,
    /// The stream's position space is exhausted.
    MaxPositionExceeded,
}

/// Exclusive writer for one `(channel, stream_id)` stream.
///
/// # Invariants
///
/// - Single writer: `offer` takes `&mut self`, so at most one offer is ever
///   outstanding per publication. Sharing a publication across tasks
///   requires external serialization, which the processor's sender task
///   provides.
pub struct Publication {
    driver: Arc<MediaDriver>,
    key: (String, i32),
    registration: u64,
    closed: bool,
}

impl Publication {
    pub(crate) fn new(
        driver: Arc<MediaDriver>,
        channel: String,
        stream_id: i32,
        registration: u64,
    ) -> Self {
        Self { driver, key: (channel, stream_id), registration, closed: false }
    }

    /// Channel this publication writes to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.key.0
    }

    /// Stream id this publication writes to.
    #[must_use]
    pub fn stream_id(&self) -> i32 {
        self.key.1
    }

    /// Largest message `offer` accepts. Larger messages are a caller bug;
    /// check `encoded_len` against this before offering.
    #[must_use]
    pub fn max_message_length(&self) -> usize {
        self.driver.max_message_length()
    }

    /// Whether at least one subscriber is attached.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed && self.driver.stream_connected(&self.key)
    }

    /// Current write position of the stream, in frames.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.driver.stream_position(&self.key)
    }

    /// Non-blocking write. Never blocks, never retries; every transient
    /// condition is reported to the caller as an [`Offer`] variant.
    pub fn offer(&mut self, message: &[u8]) -> Offer {
        if self.closed {
            return Offer::Closed;
        }
        self.driver.offer(&self.key, self.registration, message)
    }

    /// Detach from the stream and free the position counter. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.close_publication(&self.key, self.registration);
        }
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        self.close();
    }
}
