//! Polling reader view over one stream.

use std::sync::Arc;

use crate::driver::MediaDriver;

/// Polling reader for one `(channel, stream_id)` stream.
///
/// # Invariants
///
/// - Single reader: `poll` takes `&mut self`, so a subscription is polled
///   from exactly one task at a time. The dispatcher owns all of a
///   processor's subscriptions for this reason.
/// - The cursor starts at the stream head when the subscription is added;
///   frames offered before that are never seen.
pub struct Subscription {
    driver: Arc<MediaDriver>,
    key: (String, i32),
    registration: u64,
    closed: bool,
}

impl Subscription {
    pub(crate) fn new(
        driver: Arc<MediaDriver>,
        channel: String,
        stream_id: i32,
        registration: u64,
    ) -> Self {
        Self { driver, key: (channel, stream_id), registration, closed: false }
    }

    /// Channel this subscription reads from.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.key.0
    }

    /// Stream id this subscription reads from.
    #[must_use]
    pub fn stream_id(&self) -> i32 {
        self.key.1
    }

    /// Number of writers currently attached to the stream.
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.driver.stream_image_count(&self.key)
    }

    /// Drain up to `limit` frames, invoking `handler` for each in order.
    /// Returns the number of frames read; zero when the stream is empty or
    /// the subscription closed. The handler may re-enter the driver.
    pub fn poll(&mut self, mut handler: impl FnMut(&[u8]), limit: usize) -> usize {
        if self.closed {
            return 0;
        }
        self.driver.poll(&self.key, self.registration, &mut handler, limit)
    }

    /// Detach from the stream and free the position counter. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.close_subscription(&self.key, self.registration);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
