//! Reactive-Streams processor over the embedded riffle IPC transport.
//!
//! A [`Processor`] is bidirectional: it is a [`Subscriber`] that accepts
//! items from a local upstream, frames them, and writes them into an
//! outbound stream; and it is a [`Publisher`] that drains inbound streams,
//! decodes frames, and emits items to local subscribers under their
//! requested demand. The full Reactive-Streams contract - demand-driven
//! flow control, non-concurrent signal delivery, exactly-once terminals -
//! is preserved across the frame-oriented transport, which several
//! independent processors may share on one channel.
//!
//! # Architecture
//!
//! Four logical task owners exist per processor:
//!
//! 1. Producer threads call `on_next`, which enqueues into a bounded ring.
//! 2. The sender task drains the ring, gates on aggregated remote demand,
//!    and offers frames with back-pressure-aware retry.
//! 3. The dispatcher tasks poll the inbound streams: the service loop
//!    feeds the session registry and answers heartbeats; the client loop
//!    delivers decoded items downstream.
//! 4. Consumer threads call `Subscription::request`/`cancel`, which enqueue
//!    commands consumed by the client loop.
//!
//! Control flow for demand crosses the process boundary as service frames:
//! `request(n)` becomes a `More(n)` frame toward the remote sender, lands in
//! its session registry, and the demand aggregator there turns it into an
//! upstream `request`.

#![forbid(unsafe_code)]

mod context;
mod demand;
mod dispatcher;
mod error;
mod processor;
mod registry;
mod sender;
mod streams;

pub use context::Context;
pub use demand::DemandAggregator;
pub use error::CoreError;
pub use processor::{Processor, SenderMetrics};
pub use registry::{DemandSnapshot, Session, SessionRegistry};
pub use streams::{Publisher, Subscriber, Subscription, UNBOUNDED};
