//! Embedded frame-oriented IPC transport.
//!
//! An in-process media driver offering the publish/subscribe surface of a
//! user-space messaging transport: publications (write side) and
//! subscriptions (read side) identified by `(channel, stream_id)`, a
//! non-blocking [`Publication::offer`] with explicit back-pressure outcomes,
//! batch [`Subscription::poll`], and shared position counters.
//!
//! Streams are multicast: every subscription on a `(channel, stream_id)`
//! pair sees every frame offered after it attached. Delivery is ordered per
//! writer and lossy only in the sense that late joiners never replay
//! history; within the in-flight window nothing is dropped.
//!
//! The driver itself has a refcounted lifecycle managed by
//! [`DriverManager`]: the first acquisition launches it, the last release
//! begins a counter-draining shutdown, and a bounded timeout forces the
//! teardown if position counters linger.

#![forbid(unsafe_code)]

mod counters;
mod driver;
mod error;
mod manager;
mod publication;
mod subscription;

pub use counters::{CountersReader, SENDER_POS_PREFIX, SUBSCRIBER_POS_PREFIX};
pub use driver::{DriverConfig, MediaDriver};
pub use error::{ManagerError, TransportError};
pub use manager::{DriverHandle, DriverManager, LifecycleState};
pub use publication::{Offer, Publication};
pub use subscription::Subscription;
