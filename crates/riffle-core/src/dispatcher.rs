//! Inbound frame dispatch.
//!
//! Two poll loops, each owned by one tokio task:
//!
//! - [`ServiceDispatcher`] is the sender side. It drains the service stream
//!   (Join/More/Cancel/heartbeat probes from remote subscribers), mutates
//!   the session registry - it is the only task allowed to - answers
//!   heartbeats, reaps silent sessions, and turns registry snapshots into
//!   upstream `request` calls through the demand aggregator.
//! - [`ClientDispatcher`] is the receive side. It owns the data, error and
//!   service subscriptions, the downstream table, and the client's service
//!   publication. Local `subscribe` calls arrive as commands; each becomes
//!   its own wire session (Join), and its `Subscription` turns `request`
//!   and `cancel` into More/Cancel frames toward the remote sender.
//!
//! Every batch is bounded by the ring size and the loop yields between
//! batches. A decoded Next is delivered only to entries with positive
//! requested demand, decrementing after delivery; no delivery is in flight
//! while the next frame is polled, which is what makes downstream signals
//! non-concurrent. Malformed inbound frames are logged and discarded - one
//! corrupt frame must not kill the stream.
//!
//! Terminal rules: Complete is delivered to every downstream entry and
//! removes them, nothing else - several processors share a channel, and one
//! upstream finishing must not tear the fabric down. Error is delivered to
//! every entry and then shuts this processor down; on a shared multicast
//! fabric a broadcast failure is fatal to every participant.

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use riffle_ipc::{Offer, Publication, Subscription as IpcSubscription};
use riffle_proto::Frame;
use tokio::{sync::mpsc, time::Instant};

use crate::{
    context::Context,
    demand::DemandAggregator,
    error::CoreError,
    processor::Shared,
    registry::SessionRegistry,
    streams::{Subscriber, Subscription, UNBOUNDED},
};

/// Pause between empty poll batches.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Handle the client loop uses to reach the remote sender for one local
/// subscriber.
struct RemoteSubscription {
    session_id: u64,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl Subscription for RemoteSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        let _ = self.commands.send(ClientCommand::Request { session_id: self.session_id, n });
    }

    fn cancel(&self) {
        let _ = self.commands.send(ClientCommand::Cancel { session_id: self.session_id });
    }
}

/// Commands from local subscribers toward the client loop.
pub(crate) enum ClientCommand {
    /// A new local `subscribe` call.
    Register(Box<dyn Subscriber>),
    /// Demand from a downstream entry.
    Request {
        /// The entry's wire session.
        session_id: u64,
        /// Demand increment, forwarded verbatim as a More frame.
        n: u64,
    },
    /// A downstream entry abandons its session.
    Cancel {
        /// The entry's wire session.
        session_id: u64,
    },
}

/// Nonzero id a local subscriber proposes in its Join frame.
fn random_session_id() -> u64 {
    let mut buf = [0u8; 8];
    if getrandom::fill(&mut buf).is_ok() {
        let id = u64::from_be_bytes(buf);
        if id != 0 {
            return id;
        }
    }

    static FALLBACK: AtomicU64 = AtomicU64::new(1);
    FALLBACK.fetch_add(1, Ordering::Relaxed)
}

/// Sender-side service loop.
pub(crate) struct ServiceDispatcher {
    name: String,
    service_sub: IpcSubscription,
    service_pub: Publication,
    registry: SessionRegistry,
    aggregator: DemandAggregator,
    upstream: Arc<OnceLock<Arc<dyn Subscription>>>,
    shared: Arc<Shared>,
    batch_limit: usize,
    heartbeat_interval: Duration,
    auto_cancel: bool,
    upstream_cancelled: bool,
    buf: Vec<u8>,
}

impl ServiceDispatcher {
    pub(crate) fn new(
        ctx: &Context,
        service_sub: IpcSubscription,
        service_pub: Publication,
        registry: SessionRegistry,
        upstream: Arc<OnceLock<Arc<dyn Subscription>>>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            name: ctx.name.clone(),
            service_sub,
            service_pub,
            registry,
            aggregator: DemandAggregator::new(),
            upstream,
            shared,
            batch_limit: ctx.ring_buffer_size,
            heartbeat_interval: ctx.heartbeat_interval,
            auto_cancel: ctx.auto_cancel,
            upstream_cancelled: false,
            buf: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut next_reap = Instant::now() + self.heartbeat_interval;

        while self.shared.alive() {
            let mut frames: Vec<Frame> = Vec::new();
            let polled = self.service_sub.poll(
                |buf| match Frame::decode(buf) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => {
                        tracing::warn!(name = %self.name, error = %e, "malformed service frame discarded");
                    },
                },
                self.batch_limit,
            );

            let now = Instant::now();
            for frame in frames {
                self.handle(frame, now);
            }

            if now >= next_reap {
                for id in self.registry.reap(now) {
                    tracing::info!(name = %self.name, session = id, "session reaped after heartbeat timeout");
                }
                next_reap = now + self.heartbeat_interval;
            }

            for id in self.registry.purge_cancelled() {
                tracing::debug!(name = %self.name, session = id, "session removed after cancel");
            }

            self.pump_demand();

            if polled == 0 {
                tokio::select! {
                    () = tokio::time::sleep(IDLE_POLL) => {},
                    () = self.shared.closed() => {},
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        self.service_pub.close();
        self.service_sub.close();
        tracing::debug!(name = %self.name, "service dispatcher stopped");
    }

    fn handle(&mut self, frame: Frame, now: Instant) {
        match frame {
            Frame::Join { session_id } => {
                if self.registry.on_join(session_id, now) {
                    tracing::debug!(name = %self.name, session = session_id, "session joined");
                } else {
                    tracing::warn!(name = %self.name, "join with reserved broadcast id discarded");
                }
            },
            Frame::More { session_id, n } => {
                if !self.registry.on_more(session_id, n, now) {
                    // Another sender's session on a shared service stream.
                    tracing::debug!(name = %self.name, session = session_id, "demand for unknown session ignored");
                }
            },
            Frame::Cancel { session_id } => {
                if !self.registry.on_cancel(session_id) {
                    tracing::debug!(name = %self.name, session = session_id, "cancel for unknown session ignored");
                }
            },
            Frame::HeartbeatRequest { session_id, sender_nanos } => {
                if self.registry.on_heartbeat(session_id, now) {
                    self.reply_heartbeat(session_id, sender_nanos);
                }
            },
            Frame::HeartbeatReply { .. } => {
                // Client-side traffic sharing the service stream; not ours.
            },
            other => {
                tracing::warn!(name = %self.name, tag = other.tag(), "unexpected frame on service stream discarded");
            },
        }
    }

    fn reply_heartbeat(&mut self, session_id: u64, echoed_nanos: u64) {
        let frame = Frame::HeartbeatReply { session_id, echoed_nanos };
        self.buf.clear();
        frame.encode(&mut self.buf);

        match self.service_pub.offer(&self.buf) {
            Offer::Position(_) => {},
            outcome => {
                // Best effort: the prober retries on its next interval.
                tracing::debug!(name = %self.name, session = session_id, ?outcome, "heartbeat reply dropped");
            },
        }
    }

    /// Turn the registry snapshot into upstream demand, and cancel the
    /// upstream once the last session is gone if so configured.
    fn pump_demand(&mut self) {
        let Some(upstream) = self.upstream.get() else {
            return;
        };

        if let Some(delta) = self.aggregator.absorb(&self.registry.snapshot()) {
            tracing::debug!(name = %self.name, delta, "requesting upstream demand");
            upstream.request(delta);
        }

        if self.auto_cancel
            && !self.upstream_cancelled
            && self.registry.ever_joined()
            && self.registry.live_count() == 0
        {
            tracing::info!(name = %self.name, "last session left; cancelling upstream");
            upstream.cancel();
            self.upstream_cancelled = true;
        }
    }
}

/// One local subscriber's slot in the client loop.
///
/// A session is Pending until the sender's first heartbeat reply confirms
/// the Join was seen - Join frames offered before the sender's service
/// subscription exists are never replayed to it, so the client re-Joins on
/// every heartbeat interval until confirmed. Demand is not put on the wire
/// while Pending (the sender would discard More for an unknown session);
/// it accumulates and flushes on confirmation.
struct DownstreamEntry {
    subscriber: Box<dyn Subscriber>,
    requested: u64,
    confirmed: bool,
    pending_wire: u64,
}

/// Receive-side loop.
pub(crate) struct ClientDispatcher {
    name: String,
    data_sub: IpcSubscription,
    error_sub: IpcSubscription,
    service_sub: IpcSubscription,
    service_pub: Publication,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    commands_tx: mpsc::UnboundedSender<ClientCommand>,
    entries: HashMap<u64, DownstreamEntry>,
    shared: Arc<Shared>,
    batch_limit: usize,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    retry: Duration,
    linger: Duration,
    started: Instant,
    last_reply: Instant,
    next_heartbeat: Instant,
    /// Service frames drained early (see [`ClientDispatcher::send_service`])
    /// and waiting for the next `poll_service` pass.
    pending_service: Vec<Frame>,
    buf: Vec<u8>,
}

impl ClientDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: &Context,
        data_sub: IpcSubscription,
        error_sub: IpcSubscription,
        service_sub: IpcSubscription,
        service_pub: Publication,
        commands: mpsc::UnboundedReceiver<ClientCommand>,
        commands_tx: mpsc::UnboundedSender<ClientCommand>,
        shared: Arc<Shared>,
    ) -> Self {
        let now = Instant::now();
        Self {
            name: ctx.name.clone(),
            data_sub,
            error_sub,
            service_sub,
            service_pub,
            commands,
            commands_tx,
            entries: HashMap::new(),
            shared,
            batch_limit: ctx.ring_buffer_size,
            heartbeat_interval: ctx.heartbeat_interval,
            heartbeat_timeout: ctx.heartbeat_timeout,
            retry: ctx.publication_retry,
            linger: ctx.publication_linger_timeout,
            started: now,
            last_reply: now,
            next_heartbeat: now + ctx.heartbeat_interval,
            pending_service: Vec::new(),
            buf: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        while self.shared.alive() {
            let mut activity = self.drain_commands().await;
            activity += self.poll_service().await;
            activity += self.poll_data();

            let (polled, fatal) = self.poll_errors();
            activity += polled;

            self.heartbeat_pass();

            if fatal {
                self.shared.begin_shutdown();
                break;
            }

            if activity == 0 {
                tokio::select! {
                    () = tokio::time::sleep(IDLE_POLL) => {},
                    () = self.shared.closed() => {},
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        self.service_pub.close();
        self.data_sub.close();
        self.error_sub.close();
        self.service_sub.close();
        tracing::debug!(name = %self.name, "client dispatcher stopped");
    }

    /// Consume register/request/cancel commands from local subscribers.
    async fn drain_commands(&mut self) -> usize {
        let mut seen = 0;

        while let Ok(command) = self.commands.try_recv() {
            seen += 1;
            match command {
                ClientCommand::Register(mut subscriber) => {
                    let session_id = random_session_id();
                    subscriber.on_subscribe(Arc::new(RemoteSubscription {
                        session_id,
                        commands: self.commands_tx.clone(),
                    }));

                    self.entries.insert(session_id, DownstreamEntry {
                        subscriber,
                        requested: 0,
                        confirmed: false,
                        pending_wire: 0,
                    });
                    tracing::debug!(name = %self.name, session = session_id, "downstream registered");

                    // First Join attempt; re-sent each heartbeat interval
                    // until the sender confirms.
                    let _ = self.send_service(&Frame::Join { session_id }).await;
                    self.probe(session_id);
                },
                ClientCommand::Request { session_id, n } => {
                    let forward = match self.entries.get_mut(&session_id) {
                        Some(entry) => {
                            entry.requested = entry.requested.saturating_add(n);
                            if entry.confirmed {
                                true
                            } else {
                                entry.pending_wire = entry.pending_wire.saturating_add(n);
                                false
                            }
                        },
                        None => false,
                    };
                    if forward {
                        let _ = self.send_service(&Frame::More { session_id, n }).await;
                    }
                },
                ClientCommand::Cancel { session_id } => {
                    if self.entries.remove(&session_id).is_some() {
                        let _ = self.send_service(&Frame::Cancel { session_id }).await;
                        tracing::debug!(name = %self.name, session = session_id, "downstream cancelled");
                    }
                },
            }
        }

        seen
    }

    /// Watch the shared service stream for heartbeat replies to our
    /// sessions. The first reply for a session doubles as the Join
    /// confirmation and releases any demand accumulated while Pending.
    async fn poll_service(&mut self) -> usize {
        let mut frames: Vec<Frame> = std::mem::take(&mut self.pending_service);
        let polled = frames.len()
            + self.service_sub.poll(
                |buf| {
                    if let Ok(frame) = Frame::decode(buf) {
                        frames.push(frame);
                    }
                    // Malformed service frames are already logged sender-side.
                },
                self.batch_limit,
            );

        let mut flush: Vec<(u64, u64)> = Vec::new();
        for frame in frames {
            if let Frame::HeartbeatReply { session_id, .. } = frame {
                let Some(entry) = self.entries.get_mut(&session_id) else {
                    continue;
                };
                self.last_reply = Instant::now();
                if !entry.confirmed {
                    entry.confirmed = true;
                    tracing::debug!(name = %self.name, session = session_id, "session confirmed by sender");
                    if entry.pending_wire > 0 {
                        flush.push((session_id, entry.pending_wire));
                        entry.pending_wire = 0;
                    }
                }
            }
        }

        for (session_id, n) in flush {
            let _ = self.send_service(&Frame::More { session_id, n }).await;
        }

        polled
    }

    /// Deliver Next frames under per-entry demand; Complete removes every
    /// entry without touching the processor.
    fn poll_data(&mut self) -> usize {
        let mut frames: Vec<Frame> = Vec::new();
        let polled = self.data_sub.poll(
            |buf| match Frame::decode(buf) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    tracing::warn!(name = %self.name, error = %e, "malformed data frame discarded");
                },
            },
            self.batch_limit,
        );

        for frame in frames {
            match frame {
                Frame::Next { session_id, payload } => {
                    for (id, entry) in &mut self.entries {
                        if session_id != 0 && session_id != *id {
                            continue;
                        }
                        if entry.requested == 0 {
                            tracing::debug!(name = %self.name, session = *id, "next skipped: no downstream demand");
                            continue;
                        }
                        if entry.requested != UNBOUNDED {
                            entry.requested -= 1;
                        }
                        entry.subscriber.on_next(payload.clone());
                    }
                },
                Frame::Complete { .. } => {
                    let entries = std::mem::take(&mut self.entries);
                    tracing::debug!(name = %self.name, downstreams = entries.len(), "complete received");
                    for (_, mut entry) in entries {
                        entry.subscriber.on_complete();
                    }
                },
                other => {
                    tracing::warn!(name = %self.name, tag = other.tag(), "unexpected frame on data stream discarded");
                },
            }
        }

        polled
    }

    /// Deliver Error terminals. Returns `(frames_polled, fatal)`; an Error
    /// frame on a shared fabric is fatal to this processor.
    fn poll_errors(&mut self) -> (usize, bool) {
        let mut frames: Vec<Frame> = Vec::new();
        let polled = self.error_sub.poll(
            |buf| match Frame::decode(buf) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    tracing::warn!(name = %self.name, error = %e, "malformed error frame discarded");
                },
            },
            self.batch_limit,
        );

        let mut fatal = false;
        for frame in frames {
            match frame {
                Frame::Error { message, .. } => {
                    let text = String::from_utf8_lossy(&message).into_owned();
                    tracing::warn!(name = %self.name, error = %text, "error terminal received; shutting down");

                    let entries = std::mem::take(&mut self.entries);
                    for (_, mut entry) in entries {
                        entry.subscriber.on_error(CoreError::Upstream(text.clone()));
                    }
                    fatal = true;
                },
                other => {
                    tracing::warn!(name = %self.name, tag = other.tag(), "unexpected frame on error stream discarded");
                },
            }
        }

        (polled, fatal)
    }

    /// Probe sender liveness and enforce the reply deadline. Pending
    /// sessions also re-send their Join here until confirmed.
    fn heartbeat_pass(&mut self) {
        if self.entries.is_empty() {
            // Deadline armed only while someone is subscribed.
            self.last_reply = Instant::now();
            return;
        }

        let now = Instant::now();
        if now >= self.next_heartbeat {
            let sessions: Vec<(u64, bool)> =
                self.entries.iter().map(|(id, e)| (*id, e.confirmed)).collect();

            for (session_id, confirmed) in sessions {
                if !confirmed {
                    self.offer_once(&Frame::Join { session_id });
                }
                self.probe(session_id);
            }
            self.next_heartbeat = now + self.heartbeat_interval;
        }

        if now.saturating_duration_since(self.last_reply) > self.heartbeat_timeout {
            tracing::warn!(name = %self.name, "sender unresponsive; delivering transport timeout");
            let entries = std::mem::take(&mut self.entries);
            for (_, mut entry) in entries {
                entry
                    .subscriber
                    .on_error(CoreError::TransportTimeout { timeout: self.heartbeat_timeout });
            }
            self.last_reply = Instant::now();
        }
    }

    /// One liveness probe for a session, best effort - the next interval
    /// retries anyway.
    fn probe(&mut self, session_id: u64) {
        let nanos = Instant::now().duration_since(self.started).as_nanos() as u64;
        self.offer_once(&Frame::HeartbeatRequest { session_id, sender_nanos: nanos });
    }

    /// Single offer without retry, for traffic that has a natural re-send
    /// cadence (heartbeats, pending Joins).
    fn offer_once(&mut self, frame: &Frame) {
        self.buf.clear();
        frame.encode(&mut self.buf);

        match self.service_pub.offer(&self.buf) {
            Offer::Position(_) => {},
            outcome => {
                tracing::debug!(name = %self.name, tag = frame.tag(), ?outcome, "service frame dropped");
            },
        }
    }

    /// Offer a service frame with bounded retry. Join must survive the
    /// window where the remote service subscription does not exist yet, so
    /// transient outcomes are retried until the linger bound.
    async fn send_service(&mut self, frame: &Frame) -> bool {
        self.buf.clear();
        frame.encode(&mut self.buf);
        let deadline = Instant::now() + self.linger;

        loop {
            if !self.shared.alive() {
                return false;
            }

            match self.service_pub.offer(&self.buf) {
                Offer::Position(_) => return true,
                Offer::Closed | Offer::MaxPositionExceeded => {
                    tracing::warn!(name = %self.name, tag = frame.tag(), "service publication unusable");
                    return false;
                },
                Offer::Backpressured | Offer::NotConnected | Offer::AdminAction => {
                    if Instant::now() >= deadline {
                        tracing::warn!(name = %self.name, tag = frame.tag(), "service frame dropped after linger");
                        return false;
                    }
                    // Our own cursor is one of the window's readers; drain
                    // it so a full window cannot deadlock this retry loop.
                    let pending = &mut self.pending_service;
                    self.service_sub.poll(
                        |buf| {
                            if let Ok(inbound) = Frame::decode(buf) {
                                pending.push(inbound);
                            }
                        },
                        self.batch_limit,
                    );
                },
            }

            tokio::select! {
                () = tokio::time::sleep(self.retry) => {},
                () = self.shared.closed() => {},
            }
        }
    }
}
