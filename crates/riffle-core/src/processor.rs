//! The processor facade.
//!
//! A [`Processor`] composes the sender task, the session registry, the
//! demand aggregator and the two dispatch loops into one object that is
//! both a [`Subscriber`] (items in from a local upstream) and a
//! [`Publisher`] (items out to local subscribers).
//!
//! Both sides start lazily: `on_subscribe` (or the first outbound signal)
//! starts the sender side, the first `subscribe` starts the client side.
//! The upstream subscription is bound through a single-assignment cell -
//! Unbound until the first `on_subscribe`, Bound forever after; a second
//! upstream is cancelled per the Reactive-Streams rules.
//!
//! Shutdown is a single-shot compare-and-set on the `alive` flag. There is
//! no cancellation token: tasks observe the flag at their next poll, drop
//! their publications and subscriptions, and the driver manager's counter
//! drain takes care of the rest.

use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use bytes::Bytes;
use riffle_ipc::{DriverHandle, DriverManager, LifecycleState};
use tokio::sync::{Notify, mpsc, watch};

use crate::{
    context::Context,
    dispatcher::{ClientCommand, ClientDispatcher, ServiceDispatcher},
    error::CoreError,
    registry::{DemandSnapshot, SessionRegistry},
    sender::{Signal, SignalSender},
    streams::{Publisher, Subscriber, Subscription},
};

/// Counters the sender task maintains; observable for tests and
/// diagnostics.
#[derive(Debug, Default)]
pub struct SenderMetrics {
    retries: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl SenderMetrics {
    /// Retry-or-stall iterations: demand waits, back-pressure retries,
    /// not-connected retries. Monotone.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Acquire)
    }

    /// Next frames successfully offered.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }

    /// Frames dropped because every remote session left.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn add_sent(&self) {
        self.sent.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn add_drop(&self) {
        self.dropped.fetch_add(1, Ordering::AcqRel);
    }
}

/// Liveness state shared by the facade and its tasks.
///
/// `alive` is a single-shot flag: true until the first `begin_shutdown`,
/// false forever after. Tasks consume the transition lazily at their next
/// poll; `closed()` lets them sleep without missing it.
pub(crate) struct Shared {
    alive: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { alive: AtomicBool::new(true), shutdown: Notify::new() })
    }

    pub(crate) fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Single-shot transition; returns whether this call performed it.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        if was_alive {
            self.shutdown.notify_waiters();
        }
        was_alive
    }

    /// Resolves once shutdown has begun.
    pub(crate) async fn closed(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.alive() {
            return;
        }
        notified.await;
    }
}

/// Lazily-started sides and the driver claim.
struct ProcessorState {
    handle: Option<DriverHandle>,
    registry: Option<SessionRegistry>,
    ring_tx: Option<mpsc::Sender<Signal>>,
    client_tx: Option<mpsc::UnboundedSender<ClientCommand>>,
}

/// Bidirectional Reactive-Streams processor over the IPC transport.
///
/// Construct with [`Processor::create`] (single-threaded producer contract
/// enforced) or [`Processor::share`] (concurrent producers, serialized
/// through the bounded ring). A tokio runtime must be current at
/// construction; its handle is captured so the internal tasks can be
/// spawned even when a side is first touched from a plain producer thread.
pub struct Processor {
    ctx: Context,
    shared: Arc<Shared>,
    state: Mutex<ProcessorState>,
    upstream: Arc<OnceLock<Arc<dyn Subscription>>>,
    demand_rx: watch::Receiver<DemandSnapshot>,
    metrics: Arc<SenderMetrics>,
    signal_guard: AtomicBool,
    runtime: tokio::runtime::Handle,
}

impl Processor {
    /// Create a processor that enforces the Reactive-Streams
    /// single-threaded producer contract: overlapping signals are detected
    /// and rejected as [`CoreError::ProtocolViolation`].
    pub fn create(ctx: Context) -> Result<Arc<Self>, CoreError> {
        Self::build(ctx, false)
    }

    /// Create a processor that permits concurrent producers; all signals
    /// serialize through the bounded ring.
    pub fn share(ctx: Context) -> Result<Arc<Self>, CoreError> {
        Self::build(ctx, true)
    }

    fn build(mut ctx: Context, multi_publishers: bool) -> Result<Arc<Self>, CoreError> {
        ctx.multi_publishers = multi_publishers;
        ctx.validate()?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CoreError::Config(
                "a tokio runtime must be current when constructing a processor".to_string(),
            )
        })?;

        let (registry, demand_rx) = SessionRegistry::new(ctx.heartbeat_timeout);

        Ok(Arc::new(Self {
            ctx,
            shared: Shared::new(),
            state: Mutex::new(ProcessorState {
                handle: None,
                registry: Some(registry),
                ring_tx: None,
                client_tx: None,
            }),
            upstream: Arc::new(OnceLock::new()),
            demand_rx,
            metrics: Arc::new(SenderMetrics::default()),
            signal_guard: AtomicBool::new(false),
            runtime,
        }))
    }

    /// Whether the processor has not yet shut down.
    #[must_use]
    pub fn alive(&self) -> bool {
        self.shared.alive()
    }

    /// Live remote sessions joined to this sender.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.demand_rx.borrow().live
    }

    /// The sender task's counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<SenderMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The validated configuration.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Enqueue one item toward the remote subscribers. Waits when the ring
    /// is full (the share-mode bound).
    pub async fn send(&self, payload: Bytes) -> Result<(), CoreError> {
        let ring = self.sender_ring()?;
        let _guard = self.enter_signal()?;
        ring.send(Signal::Next(payload)).await.map_err(|_| CoreError::PublicationClosed)
    }

    /// Enqueue the normal terminal. Pending items drain first.
    pub async fn complete(&self) -> Result<(), CoreError> {
        let ring = self.sender_ring()?;
        let _guard = self.enter_signal()?;
        ring.send(Signal::Complete).await.map_err(|_| CoreError::PublicationClosed)
    }

    /// Enqueue the failure terminal. Pending items drain first; the error
    /// frame then goes out on the error stream and, once received back off
    /// the shared fabric, shuts this processor down with everyone else's.
    pub async fn error(&self, message: impl Into<String>) -> Result<(), CoreError> {
        let ring = self.sender_ring()?;
        let _guard = self.enter_signal()?;
        ring.send(Signal::Error(message.into())).await.map_err(|_| CoreError::PublicationClosed)
    }

    /// Blocking variant of [`Processor::send`] for dedicated producer
    /// threads. Must not be called from an async context.
    pub fn blocking_send(&self, payload: Bytes) -> Result<(), CoreError> {
        let ring = self.sender_ring()?;
        let _guard = self.enter_signal()?;
        ring.blocking_send(Signal::Next(payload)).map_err(|_| CoreError::PublicationClosed)
    }

    /// Blocking variant of [`Processor::complete`].
    pub fn blocking_complete(&self) -> Result<(), CoreError> {
        let ring = self.sender_ring()?;
        let _guard = self.enter_signal()?;
        ring.blocking_send(Signal::Complete).map_err(|_| CoreError::PublicationClosed)
    }

    /// Blocking variant of [`Processor::error`].
    pub fn blocking_error(&self, message: impl Into<String>) -> Result<(), CoreError> {
        let ring = self.sender_ring()?;
        let _guard = self.enter_signal()?;
        ring.blocking_send(Signal::Error(message.into())).map_err(|_| CoreError::PublicationClosed)
    }

    /// Bind the upstream subscription and start the sender side.
    ///
    /// The binding is single-assignment: the first upstream wins, any later
    /// one is cancelled.
    pub fn bind_upstream(&self, subscription: Arc<dyn Subscription>) {
        if let Err(rejected) = self.upstream.set(subscription) {
            tracing::warn!(name = %self.ctx.name, "upstream already bound; cancelling the new subscription");
            rejected.cancel();
            return;
        }

        let mut state = lock(&self.state);
        if let Err(e) = self.ensure_sender_side(&mut state) {
            drop(state);
            tracing::error!(name = %self.ctx.name, error = %e, "sender side failed to start");
            self.shutdown();
        }
    }

    /// Idempotent shutdown: the first call flips the single-shot `alive`
    /// flag and drops the facade's handles; tasks observe the flag at their
    /// next poll and release theirs. Subsequent calls are no-ops.
    pub fn shutdown(&self) {
        if !self.shared.begin_shutdown() {
            return;
        }

        tracing::info!(name = %self.ctx.name, "processor shutting down");

        let mut state = lock(&self.state);
        state.ring_tx = None;
        state.client_tx = None;
        // Dropping the handle releases the manager refcount; the counter
        // drain waits for the tasks to close their streams.
        state.handle = None;
    }

    fn sender_ring(&self) -> Result<mpsc::Sender<Signal>, CoreError> {
        if !self.alive() {
            return Err(CoreError::PublicationClosed);
        }
        let mut state = lock(&self.state);
        self.ensure_sender_side(&mut state)
    }

    /// Start the sender task and the service dispatch loop once.
    fn ensure_sender_side(
        &self,
        state: &mut ProcessorState,
    ) -> Result<mpsc::Sender<Signal>, CoreError> {
        if let Some(tx) = &state.ring_tx {
            return Ok(tx.clone());
        }

        self.ensure_driver(state)?;
        let handle = state
            .handle
            .as_ref()
            .ok_or_else(|| CoreError::Driver("driver handle missing".to_string()))?;

        let data = handle.add_publication(&self.ctx.sender_channel, self.ctx.stream_id)?;
        let errors = handle.add_publication(&self.ctx.sender_channel, self.ctx.error_stream_id)?;
        let service_pub = handle
            .add_publication(&self.ctx.sender_channel, self.ctx.service_request_stream_id)?;
        let service_sub = handle
            .add_subscription(&self.ctx.sender_channel, self.ctx.service_request_stream_id)?;

        let registry = state
            .registry
            .take()
            .ok_or_else(|| CoreError::Driver("session registry already consumed".to_string()))?;

        let (ring_tx, ring_rx) = mpsc::channel(self.ctx.ring_buffer_size);

        let sender = SignalSender::new(
            self.ctx.name.clone(),
            data,
            errors,
            ring_rx,
            self.demand_rx.clone(),
            self.ctx.publication_retry,
            self.ctx.publication_linger_timeout,
            Arc::clone(&self.shared),
            Arc::clone(&self.metrics),
        );
        self.runtime.spawn(sender.run());

        let dispatcher = ServiceDispatcher::new(
            &self.ctx,
            service_sub,
            service_pub,
            registry,
            Arc::clone(&self.upstream),
            Arc::clone(&self.shared),
        );
        self.runtime.spawn(dispatcher.run());

        tracing::info!(name = %self.ctx.name, channel = %self.ctx.sender_channel, "sender side started");
        state.ring_tx = Some(ring_tx.clone());
        Ok(ring_tx)
    }

    /// Start the client dispatch loop once.
    fn ensure_client_side(
        &self,
        state: &mut ProcessorState,
    ) -> Result<mpsc::UnboundedSender<ClientCommand>, CoreError> {
        if let Some(tx) = &state.client_tx {
            return Ok(tx.clone());
        }

        self.ensure_driver(state)?;
        let handle = state
            .handle
            .as_ref()
            .ok_or_else(|| CoreError::Driver("driver handle missing".to_string()))?;

        let data_sub = handle.add_subscription(&self.ctx.receiver_channel, self.ctx.stream_id)?;
        let error_sub =
            handle.add_subscription(&self.ctx.receiver_channel, self.ctx.error_stream_id)?;
        let service_sub = handle
            .add_subscription(&self.ctx.receiver_channel, self.ctx.service_request_stream_id)?;
        let service_pub = handle
            .add_publication(&self.ctx.receiver_channel, self.ctx.service_request_stream_id)?;

        let (tx, rx) = mpsc::unbounded_channel();

        let dispatcher = ClientDispatcher::new(
            &self.ctx,
            data_sub,
            error_sub,
            service_sub,
            service_pub,
            rx,
            tx.clone(),
            Arc::clone(&self.shared),
        );
        self.runtime.spawn(dispatcher.run());

        tracing::info!(name = %self.ctx.name, channel = %self.ctx.receiver_channel, "client side started");
        state.client_tx = Some(tx.clone());
        Ok(tx)
    }

    /// Acquire the driver once per processor.
    fn ensure_driver(&self, state: &mut ProcessorState) -> Result<(), CoreError> {
        if state.handle.is_some() {
            return Ok(());
        }

        let manager = self.ctx.driver.clone().unwrap_or_else(DriverManager::global);
        if !self.ctx.launch_embedded_driver && manager.state() != LifecycleState::Started {
            return Err(CoreError::Config(
                "embedded driver launch disabled and no driver is running".to_string(),
            ));
        }

        state.handle = Some(manager.acquire()?);
        Ok(())
    }

    /// Create-mode non-reentrancy guard. In share mode this is a no-op;
    /// in create mode a detected overlap is a contract violation.
    fn enter_signal(&self) -> Result<SignalGuard<'_>, CoreError> {
        if self.ctx.multi_publishers {
            return Ok(SignalGuard { flag: None });
        }

        if self
            .signal_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoreError::ProtocolViolation(
                "concurrent signals on a create-mode processor".to_string(),
            ));
        }
        Ok(SignalGuard { flag: Some(&self.signal_guard) })
    }
}

impl Publisher for Processor {
    fn subscribe(&self, subscriber: Box<dyn Subscriber>) {
        let mut subscriber = subscriber;

        if !self.alive() {
            subscriber.on_error(CoreError::PublicationClosed);
            return;
        }

        let tx = {
            let mut state = lock(&self.state);
            match self.ensure_client_side(&mut state) {
                Ok(tx) => tx,
                Err(e) => {
                    drop(state);
                    tracing::warn!(name = %self.ctx.name, error = %e, "client side failed to start");
                    subscriber.on_error(e);
                    return;
                },
            }
        };

        if let Err(rejected) = tx.send(ClientCommand::Register(subscriber)) {
            if let ClientCommand::Register(mut subscriber) = rejected.0 {
                subscriber.on_error(CoreError::PublicationClosed);
            }
        }
    }
}

impl Subscriber for Arc<Processor> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        Processor::bind_upstream(self, subscription);
    }

    /// Blocking enqueue for dedicated producer threads; see
    /// [`Processor::blocking_send`].
    fn on_next(&mut self, item: Bytes) {
        if let Err(e) = Processor::blocking_send(self, item) {
            tracing::warn!(name = %self.ctx.name, error = %e, "on_next dropped");
        }
    }

    fn on_error(&mut self, error: CoreError) {
        if let Err(e) = Processor::blocking_error(self, error.to_string()) {
            tracing::warn!(name = %self.ctx.name, error = %e, "on_error dropped");
        }
    }

    fn on_complete(&mut self) {
        if let Err(e) = Processor::blocking_complete(self) {
            tracing::warn!(name = %self.ctx.name, error = %e, "on_complete dropped");
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears the create-mode guard when a signal entry ends.
struct SignalGuard<'a> {
    flag: Option<&'a AtomicBool>,
}

impl Drop for SignalGuard<'_> {
    fn drop(&mut self) {
        if let Some(flag) = self.flag {
            flag.store(false, Ordering::Release);
        }
    }
}

/// State lock; poisoning would only mean a panicking thread died between
/// individually-valid field updates.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
