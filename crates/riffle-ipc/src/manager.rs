//! Refcounted driver lifecycle.
//!
//! One embedded media driver is shared by every processor in the process.
//! The manager counts handles: the first [`DriverManager::acquire`] launches
//! the driver, the last release begins shutdown.
//!
//! # State machine
//!
//! ```text
//! ┌────────────┐ acquire ┌─────────┐ refcount=0 ┌──────────────┐
//! │ NotStarted │────────>│ Started │───────────>│ ShuttingDown │
//! └────────────┘         └─────────┘            └──────┬───────┘
//!        ^                                             │ counters drained
//!        └─────────────────────────────────────────────┘ or timeout
//! ```
//!
//! Shutdown is not immediate: publications and subscriptions can outlive
//! the handle that created them, and forcing the driver down while their
//! position counters are live risks dropping frames a reader has not
//! drained. The reaper thread therefore polls the counters every
//! `retry_shutdown` until none with a `sender pos` / `subscriber pos` label
//! remain, bounded by `shutdown_timeout`, then forces the teardown and
//! removes the driver directory.
//!
//! All transitions are serialized through one lock. `acquire` during
//! ShuttingDown is surfaced as [`ManagerError::ShuttingDown`], never a
//! panic.

use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    thread,
    time::Instant,
};

use crate::{
    driver::{DriverConfig, MediaDriver},
    error::{ManagerError, TransportError},
    publication::Publication,
    subscription::Subscription,
};

/// Manager lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No driver is running.
    NotStarted,
    /// The driver is live and refcounted.
    Started,
    /// The last handle was released; the reaper is draining counters.
    ShuttingDown,
}

struct ManagerInner {
    state: LifecycleState,
    refcount: u32,
    driver: Option<Arc<MediaDriver>>,
}

/// Process-wide refcounted owner of the embedded driver.
///
/// Tests construct their own instances with [`DriverManager::new`];
/// production code shares [`DriverManager::global`].
pub struct DriverManager {
    config: DriverConfig,
    inner: Mutex<ManagerInner>,
}

static GLOBAL: OnceLock<Arc<DriverManager>> = OnceLock::new();

impl DriverManager {
    /// Create a fresh manager in `NotStarted` state.
    #[must_use]
    pub fn new(config: DriverConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(ManagerInner {
                state: LifecycleState::NotStarted,
                refcount: 0,
                driver: None,
            }),
        })
    }

    /// The process-wide manager, created on first use with default config.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Self::new(DriverConfig::default())))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        lock(&self.inner).state
    }

    /// Number of live handles.
    #[must_use]
    pub fn refcount(&self) -> u32 {
        lock(&self.inner).refcount
    }

    /// Acquire a handle, launching the driver on the first acquisition.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::ShuttingDown`] while a shutdown is pending.
    /// - [`ManagerError::Transport`] if the driver fails to launch.
    pub fn acquire(self: &Arc<Self>) -> Result<DriverHandle, ManagerError> {
        let mut inner = lock(&self.inner);

        match inner.state {
            LifecycleState::ShuttingDown => Err(ManagerError::ShuttingDown),
            LifecycleState::NotStarted => {
                let driver = MediaDriver::launch(&self.config)?;
                inner.state = LifecycleState::Started;
                inner.refcount = 1;
                inner.driver = Some(Arc::clone(&driver));
                tracing::info!(name = %self.config.name, "driver manager started");
                Ok(DriverHandle { manager: Arc::clone(self), driver })
            },
            LifecycleState::Started => {
                let driver = inner.driver.as_ref().ok_or(TransportError::Closed)?;
                let driver = Arc::clone(driver);
                inner.refcount += 1;
                Ok(DriverHandle { manager: Arc::clone(self), driver })
            },
        }
    }

    /// Begin shutdown regardless of refcount.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::ShuttingDown`] if a shutdown is already pending -
    ///   the race is surfaced as an error, not a panic. `NotStarted` is a
    ///   no-op.
    pub fn shutdown(self: &Arc<Self>) -> Result<(), ManagerError> {
        let mut inner = lock(&self.inner);
        match inner.state {
            LifecycleState::NotStarted => Ok(()),
            LifecycleState::ShuttingDown => Err(ManagerError::ShuttingDown),
            LifecycleState::Started => {
                self.begin_shutdown(&mut inner);
                Ok(())
            },
        }
    }

    fn release(self: &Arc<Self>) {
        let mut inner = lock(&self.inner);
        inner.refcount = inner.refcount.saturating_sub(1);

        if inner.refcount == 0
            && inner.state == LifecycleState::Started
            && self.config.auto_shutdown
        {
            self.begin_shutdown(&mut inner);
        }
    }

    /// Transition to ShuttingDown and start the counter-draining reaper.
    /// Caller holds the lock and has verified `state == Started`.
    fn begin_shutdown(self: &Arc<Self>, inner: &mut ManagerInner) {
        inner.state = LifecycleState::ShuttingDown;
        let Some(driver) = inner.driver.as_ref().map(Arc::clone) else {
            inner.state = LifecycleState::NotStarted;
            return;
        };

        tracing::info!(name = %self.config.name, "driver manager shutting down");

        let manager = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-reaper", self.config.name))
            .spawn(move || manager.drain_and_finish(&driver));

        if let Err(e) = spawned {
            tracing::warn!(error = %e, "reaper thread failed to spawn; forcing shutdown inline");
            let driver = inner.driver.take();
            inner.state = LifecycleState::NotStarted;
            if let Some(driver) = driver {
                driver.force_shutdown();
            }
        }
    }

    /// Reaper body: wait for position counters to drain, bounded by the
    /// shutdown timeout, then force the teardown.
    fn drain_and_finish(self: &Arc<Self>, driver: &Arc<MediaDriver>) {
        let deadline = Instant::now() + self.config.shutdown_timeout;

        loop {
            if !driver.counters().has_position_counters() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    name = %self.config.name,
                    "shutdown timeout elapsed with live position counters; forcing"
                );
                break;
            }
            thread::sleep(self.config.retry_shutdown);
        }

        let driver = {
            let mut inner = lock(&self.inner);
            if inner.state != LifecycleState::ShuttingDown {
                return;
            }
            inner.driver.take()
        };

        // Tear down before flipping the state: observers of NotStarted may
        // rely on the directory being gone already.
        if let Some(driver) = driver {
            driver.force_shutdown();
        }

        lock(&self.inner).state = LifecycleState::NotStarted;
    }
}

/// Scoped claim on the embedded driver; releases on drop.
pub struct DriverHandle {
    manager: Arc<DriverManager>,
    driver: Arc<MediaDriver>,
}

impl DriverHandle {
    /// The driver this handle keeps alive.
    #[must_use]
    pub fn driver(&self) -> &Arc<MediaDriver> {
        &self.driver
    }

    /// Add a publication through this handle.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Closed`] if the driver was torn down.
    pub fn add_publication(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Publication, TransportError> {
        self.driver.add_publication(channel, stream_id)
    }

    /// Add a subscription through this handle.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Closed`] if the driver was torn down.
    pub fn add_subscription(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Subscription, TransportError> {
        self.driver.add_subscription(channel, stream_id)
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        DriverManager::release(&self.manager);
    }
}

/// Manager lock; poisoning would only mean a panicking thread died between
/// field updates that are individually valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_manager(name: &str) -> Arc<DriverManager> {
        DriverManager::new(DriverConfig {
            name: name.to_string(),
            retry_shutdown: Duration::from_millis(5),
            shutdown_timeout: Duration::from_millis(500),
            dir: Some(tempfile::tempdir().unwrap().keep()),
            ..DriverConfig::default()
        })
    }

    fn wait_for_state(manager: &DriverManager, want: LifecycleState) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while manager.state() != want {
            assert!(Instant::now() < deadline, "timed out waiting for {want:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn acquire_starts_and_counts() {
        let manager = test_manager("mgr-count");
        assert_eq!(manager.state(), LifecycleState::NotStarted);

        let a = manager.acquire().unwrap();
        assert_eq!(manager.state(), LifecycleState::Started);
        assert_eq!(manager.refcount(), 1);

        let b = manager.acquire().unwrap();
        let c = manager.acquire().unwrap();
        assert_eq!(manager.refcount(), 3);
        assert!(Arc::ptr_eq(a.driver(), b.driver()));
        assert!(Arc::ptr_eq(b.driver(), c.driver()));

        drop(b);
        assert_eq!(manager.refcount(), 2);
        assert_eq!(manager.state(), LifecycleState::Started);

        drop((a, c));
        wait_for_state(&manager, LifecycleState::NotStarted);
    }

    #[test]
    fn acquire_during_shutdown_is_rejected() {
        let manager = DriverManager::new(DriverConfig {
            name: "mgr-race".to_string(),
            // Long enough that the reaper is still draining when we race it
            retry_shutdown: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(2),
            dir: Some(tempfile::tempdir().unwrap().keep()),
            ..DriverConfig::default()
        });

        let handle = manager.acquire().unwrap();
        // Keep a subscription alive so the counters cannot drain instantly.
        let subscription = handle.add_subscription("mem:race", 1).unwrap();
        drop(handle);

        assert_eq!(manager.state(), LifecycleState::ShuttingDown);
        assert!(matches!(manager.acquire(), Err(ManagerError::ShuttingDown)));
        assert!(matches!(manager.shutdown(), Err(ManagerError::ShuttingDown)));

        drop(subscription);
        wait_for_state(&manager, LifecycleState::NotStarted);

        // Restartable after the cycle completes.
        let again = manager.acquire().unwrap();
        assert_eq!(manager.state(), LifecycleState::Started);
        drop(again);
        wait_for_state(&manager, LifecycleState::NotStarted);
    }

    #[test]
    fn auto_shutdown_disabled_keeps_driver_running() {
        let manager = DriverManager::new(DriverConfig {
            name: "mgr-manual".to_string(),
            auto_shutdown: false,
            retry_shutdown: Duration::from_millis(5),
            shutdown_timeout: Duration::from_millis(500),
            dir: Some(tempfile::tempdir().unwrap().keep()),
            ..DriverConfig::default()
        });

        let handle = manager.acquire().unwrap();
        drop(handle);

        assert_eq!(manager.state(), LifecycleState::Started);
        assert_eq!(manager.refcount(), 0);

        manager.shutdown().unwrap();
        wait_for_state(&manager, LifecycleState::NotStarted);
    }

    #[test]
    fn shutdown_when_not_started_is_a_no_op() {
        let manager = test_manager("mgr-noop");
        manager.shutdown().unwrap();
        assert_eq!(manager.state(), LifecycleState::NotStarted);
    }

    #[test]
    fn lingering_counters_are_forced_out_at_timeout() {
        let manager = DriverManager::new(DriverConfig {
            name: "mgr-force".to_string(),
            retry_shutdown: Duration::from_millis(5),
            shutdown_timeout: Duration::from_millis(50),
            dir: Some(tempfile::tempdir().unwrap().keep()),
            ..DriverConfig::default()
        });

        let handle = manager.acquire().unwrap();
        let driver = Arc::clone(handle.driver());
        // Never dropped before the timeout: its counter pins the driver.
        let _lingering = handle.add_publication("mem:force", 1).unwrap();
        drop(handle);

        wait_for_state(&manager, LifecycleState::NotStarted);
        assert!(driver.is_closed());
    }
}
