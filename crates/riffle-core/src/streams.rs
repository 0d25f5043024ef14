//! Reactive-Streams contract surface.
//!
//! The minimal trait set the processor implements and consumes:
//! demand-driven flow control via [`Subscription::request`], non-concurrent
//! `on_*` delivery, and a single terminal (`on_complete` xor `on_error`)
//! after which a subscriber receives nothing further.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::CoreError;

/// Demand value meaning "no bound".
pub use riffle_proto::UNBOUNDED;

/// Link from a subscriber back to its producer.
///
/// Both methods are non-blocking: they enqueue toward the owning dispatch
/// task and return. Cancellation is consumed lazily by the next dispatch
/// pass; a few in-flight items may still arrive after `cancel`.
pub trait Subscription: Send + Sync {
    /// Grant `n` more items of demand. [`UNBOUNDED`] lifts the bound.
    fn request(&self, n: u64);

    /// Abandon the subscription. No terminal signal follows.
    fn cancel(&self);
}

/// Receiver of a stream of items.
///
/// Implementations may assume the caller serializes all signals: no two
/// `on_*` calls overlap, and no signal follows a terminal.
pub trait Subscriber: Send {
    /// First signal: the link for requesting demand.
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);

    /// One item. Only delivered while requested demand is positive.
    fn on_next(&mut self, item: Bytes);

    /// Terminal: the stream failed.
    fn on_error(&mut self, error: CoreError);

    /// Terminal: the stream finished normally.
    fn on_complete(&mut self);
}

/// Source of a stream of items.
pub trait Publisher {
    /// Attach `subscriber`. It receives `on_subscribe` first, then items as
    /// demand allows, then exactly one terminal.
    fn subscribe(&self, subscriber: Box<dyn Subscriber>);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        granted: std::sync::Mutex<Vec<u64>>,
    }

    impl Subscription for Probe {
        fn request(&self, n: u64) {
            self.granted.lock().unwrap().push(n);
        }

        fn cancel(&self) {}
    }

    #[test]
    fn subscription_is_object_safe_and_shareable() {
        let probe = Arc::new(Probe { granted: std::sync::Mutex::new(Vec::new()) });
        let shared: Arc<dyn Subscription> = probe.clone();
        let other = Arc::clone(&shared);

        shared.request(1);
        other.request(UNBOUNDED);

        assert_eq!(*probe.granted.lock().unwrap(), vec![1, UNBOUNDED]);
    }
}
