//! In-process media driver.
//!
//! Streams live entirely in memory: one bounded frame log per
//! `(channel, stream_id)` pair, one write position per publication, one
//! cursor per subscription. Multicast falls out of the representation -
//! every cursor walks the same log - and the back-pressure window is the
//! distance between the head and the slowest cursor.
//!
//! The driver also owns a scratch directory on disk. The directory carries
//! no frame data; it exists so the lifecycle protocol (launch, counter
//! drain, forced teardown, directory removal) is observable the same way it
//! would be for a shared-memory transport.

use std::{
    collections::{HashMap, VecDeque},
    env, fs,
    path::PathBuf,
    process,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;

use crate::{
    counters::{CounterSet, CountersReader, SENDER_POS_PREFIX, SUBSCRIBER_POS_PREFIX},
    error::TransportError,
    publication::{Offer, Publication},
    subscription::Subscription,
};

/// Default per-stream in-flight window, in frames.
pub const DEFAULT_TERM_WINDOW: usize = 1024;

/// Default maximum message length (64 KiB).
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 64 * 1024;

/// Default interval between shutdown counter inspections.
pub const DEFAULT_RETRY_SHUTDOWN: Duration = Duration::from_millis(50);

/// Default bound on the counter-draining shutdown loop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Media driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Driver name; becomes part of the scratch directory name.
    pub name: String,
    /// Per-stream in-flight window in frames. A publication is
    /// back-pressured once the slowest subscriber lags this far behind.
    pub term_window: usize,
    /// Largest message a publication accepts.
    pub max_message_length: usize,
    /// Interval between counter inspections while shutting down.
    pub retry_shutdown: Duration,
    /// Bound on the shutdown loop; elapsed means forced teardown.
    pub shutdown_timeout: Duration,
    /// Whether the manager tears the driver down when the refcount hits
    /// zero.
    pub auto_shutdown: bool,
    /// Scratch directory override. Defaults to
    /// `<tmpdir>/<name>-<pid>`.
    pub dir: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: "riffle".to_string(),
            term_window: DEFAULT_TERM_WINDOW,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            retry_shutdown: DEFAULT_RETRY_SHUTDOWN,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            auto_shutdown: true,
            dir: None,
        }
    }
}

type StreamKey = (String, i32);

struct WriterSlot {
    counter: usize,
    position: Arc<AtomicU64>,
}

struct ReaderSlot {
    cursor: u64,
    counter: usize,
    position: Arc<AtomicU64>,
}

/// One in-memory stream: a frame log plus writer/reader bookkeeping.
#[derive(Default)]
struct StreamState {
    frames: VecDeque<Bytes>,
    /// Position of `frames.front()`.
    base: u64,
    /// Next position to write.
    head: u64,
    writers: HashMap<u64, WriterSlot>,
    readers: HashMap<u64, ReaderSlot>,
}

impl StreamState {
    fn min_cursor(&self) -> Option<u64> {
        self.readers.values().map(|r| r.cursor).min()
    }

    /// Drop frames every reader has consumed.
    fn collect_consumed(&mut self) {
        let floor = self.min_cursor().unwrap_or(self.head);
        while self.base < floor {
            self.frames.pop_front();
            self.base += 1;
        }
    }
}

/// The embedded in-process media driver.
///
/// Cheap to share: handles hold an `Arc` and all stream state sits behind a
/// single mutex. Handles stay valid after [`MediaDriver::force_shutdown`];
/// their operations report `Closed` / empty polls from then on.
pub struct MediaDriver {
    name: String,
    dir: PathBuf,
    term_window: usize,
    max_message_length: usize,
    streams: Mutex<HashMap<StreamKey, StreamState>>,
    counters: Arc<CounterSet>,
    next_registration: AtomicU64,
    closed: AtomicBool,
}

impl MediaDriver {
    /// Launch a driver and create its scratch directory.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Directory`] if the scratch directory cannot be
    ///   created.
    pub fn launch(config: &DriverConfig) -> Result<Arc<Self>, TransportError> {
        let dir = config
            .dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join(format!("{}-{}", config.name, process::id())));

        fs::create_dir_all(&dir).map_err(|source| TransportError::Directory {
            path: dir.display().to_string(),
            source,
        })?;

        tracing::info!(name = %config.name, dir = %dir.display(), "media driver launched");

        Ok(Arc::new(Self {
            name: config.name.clone(),
            dir,
            term_window: config.term_window.max(1),
            max_message_length: config.max_message_length,
            streams: Mutex::new(HashMap::new()),
            counters: Arc::new(CounterSet::default()),
            next_registration: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }))
    }

    /// Driver name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scratch directory path.
    #[must_use]
    pub fn directory(&self) -> &std::path::Path {
        &self.dir
    }

    /// Largest message a publication accepts.
    #[must_use]
    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    /// Whether the driver has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// View over the driver's position counters.
    #[must_use]
    pub fn counters(&self) -> CountersReader {
        self.counters.reader()
    }

    /// Add an exclusive writer for `(channel, stream_id)`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Closed`] if the driver was torn down.
    pub fn add_publication(
        self: &Arc<Self>,
        channel: &str,
        stream_id: i32,
    ) -> Result<Publication, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let (counter, position) =
            self.counters.allocate(format!("{SENDER_POS_PREFIX}: {channel} stream={stream_id}"));

        let mut streams = lock(&self.streams);
        let stream = streams.entry((channel.to_string(), stream_id)).or_default();
        position.store(stream.head, Ordering::Release);
        stream.writers.insert(registration, WriterSlot { counter, position });

        tracing::debug!(channel, stream_id, registration, "publication added");
        Ok(Publication::new(Arc::clone(self), channel.to_string(), stream_id, registration))
    }

    /// Add a reader for `(channel, stream_id)`. The cursor starts at the
    /// current head: late joiners never replay history.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Closed`] if the driver was torn down.
    pub fn add_subscription(
        self: &Arc<Self>,
        channel: &str,
        stream_id: i32,
    ) -> Result<Subscription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let (counter, position) = self
            .counters
            .allocate(format!("{SUBSCRIBER_POS_PREFIX}: {channel} stream={stream_id}"));

        let mut streams = lock(&self.streams);
        let stream = streams.entry((channel.to_string(), stream_id)).or_default();
        position.store(stream.head, Ordering::Release);
        stream
            .readers
            .insert(registration, ReaderSlot { cursor: stream.head, counter, position });

        tracing::debug!(channel, stream_id, registration, "subscription added");
        Ok(Subscription::new(Arc::clone(self), channel.to_string(), stream_id, registration))
    }

    /// Tear the driver down: drop all streams, free all counters, remove
    /// the scratch directory. Idempotent.
    pub fn force_shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut streams = lock(&self.streams);
        for stream in streams.values() {
            for writer in stream.writers.values() {
                self.counters.free(writer.counter);
            }
            for reader in stream.readers.values() {
                self.counters.free(reader.counter);
            }
        }
        streams.clear();
        drop(streams);

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "driver directory cleanup failed");
            },
        }

        tracing::info!(name = %self.name, "media driver shut down");
    }

    /// Non-blocking write used by [`Publication::offer`].
    pub(crate) fn offer(&self, key: &StreamKey, registration: u64, message: &[u8]) -> Offer {
        if self.is_closed() {
            return Offer::Closed;
        }

        debug_assert!(message.len() <= self.max_message_length);

        let mut streams = lock(&self.streams);
        let Some(stream) = streams.get_mut(key) else {
            return Offer::Closed;
        };
        if !stream.writers.contains_key(&registration) {
            return Offer::Closed;
        }

        if stream.readers.is_empty() {
            return Offer::NotConnected;
        }

        let floor = stream.min_cursor().unwrap_or(stream.head);
        if stream.head - floor >= self.term_window as u64 {
            return Offer::Backpressured;
        }

        let Some(next) = stream.head.checked_add(1) else {
            return Offer::MaxPositionExceeded;
        };

        stream.frames.push_back(Bytes::copy_from_slice(message));
        stream.head = next;
        for writer in stream.writers.values() {
            writer.position.store(next, Ordering::Release);
        }
        stream.collect_consumed();

        Offer::Position(next)
    }

    /// Batch read used by [`Subscription::poll`]. Frames are copied out
    /// under the lock and delivered after it is released, so handlers may
    /// re-enter the driver (e.g. to offer a reply).
    pub(crate) fn poll(
        &self,
        key: &StreamKey,
        registration: u64,
        handler: &mut dyn FnMut(&[u8]),
        limit: usize,
    ) -> usize {
        let mut batch: Vec<Bytes> = Vec::new();

        {
            let mut streams = lock(&self.streams);
            let Some(stream) = streams.get_mut(key) else {
                return 0;
            };
            let head = stream.head;
            let base = stream.base;
            let Some(reader) = stream.readers.get_mut(&registration) else {
                return 0;
            };

            while batch.len() < limit && reader.cursor < head {
                let index = (reader.cursor - base) as usize;
                if let Some(frame) = stream.frames.get(index) {
                    batch.push(frame.clone());
                }
                reader.cursor += 1;
            }
            reader.position.store(reader.cursor, Ordering::Release);
            stream.collect_consumed();
        }

        for frame in &batch {
            handler(frame);
        }
        batch.len()
    }

    /// Whether any reader is attached to the stream.
    pub(crate) fn stream_connected(&self, key: &StreamKey) -> bool {
        let streams = lock(&self.streams);
        streams.get(key).is_some_and(|s| !s.readers.is_empty())
    }

    /// Current write position of the stream.
    pub(crate) fn stream_position(&self, key: &StreamKey) -> u64 {
        let streams = lock(&self.streams);
        streams.get(key).map_or(0, |s| s.head)
    }

    /// Number of writers attached to the stream.
    pub(crate) fn stream_image_count(&self, key: &StreamKey) -> usize {
        let streams = lock(&self.streams);
        streams.get(key).map_or(0, |s| s.writers.len())
    }

    pub(crate) fn close_publication(&self, key: &StreamKey, registration: u64) {
        let mut streams = lock(&self.streams);
        if let Some(stream) = streams.get_mut(key) {
            if let Some(writer) = stream.writers.remove(&registration) {
                self.counters.free(writer.counter);
            }
            if stream.writers.is_empty() && stream.readers.is_empty() {
                streams.remove(key);
            }
        }
    }

    pub(crate) fn close_subscription(&self, key: &StreamKey, registration: u64) {
        let mut streams = lock(&self.streams);
        if let Some(stream) = streams.get_mut(key) {
            if let Some(reader) = stream.readers.remove(&registration) {
                self.counters.free(reader.counter);
            }
            stream.collect_consumed();
            if stream.writers.is_empty() && stream.readers.is_empty() {
                streams.remove(key);
            }
        }
    }
}

/// Stream-map lock; poisoning only means a panicking thread died mid-update
/// and the map itself is still structurally valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
