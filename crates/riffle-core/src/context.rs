//! Processor configuration.
//!
//! Plain struct with public fields and documented defaults; validated once
//! by the [`Processor`](crate::Processor) constructors and immutable from
//! then on.

use std::{fmt, sync::Arc, time::Duration};

use riffle_ipc::DriverManager;

use crate::error::CoreError;

/// Default data stream id.
pub const DEFAULT_STREAM_ID: i32 = 1;

/// Default error stream id.
pub const DEFAULT_ERROR_STREAM_ID: i32 = 2;

/// Default service-request stream id.
pub const DEFAULT_SERVICE_REQUEST_STREAM_ID: i32 = 3;

/// Default outbound ring capacity, in signals.
pub const DEFAULT_RING_BUFFER_SIZE: usize = 1024;

/// Default pause between publication retries.
pub const DEFAULT_PUBLICATION_RETRY: Duration = Duration::from_millis(100);

/// Default bound on publication retries, and the grace period before a
/// terminated publication closes.
pub const DEFAULT_PUBLICATION_LINGER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between heartbeat probes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Default liveness bound (should be several intervals).
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// Processor configuration.
///
/// `sender_channel` names the streams this processor writes (data, error,
/// and heartbeat replies on the service stream); `receiver_channel` names
/// the streams it reads. Two processors talk when one's sender channel is
/// the other's receiver channel; a shared fabric uses one channel for both.
#[derive(Clone)]
pub struct Context {
    /// Processor name, used in logs and driver task names.
    pub name: String,
    /// Channel for outbound streams. Default `"mem:riffle"`.
    pub sender_channel: String,
    /// Channel for inbound streams. Default `"mem:riffle"`.
    pub receiver_channel: String,
    /// Data stream id. Default [`DEFAULT_STREAM_ID`].
    pub stream_id: i32,
    /// Error stream id; terminal errors travel here so a broadcast failure
    /// reaches peers that stopped reading data. Default
    /// [`DEFAULT_ERROR_STREAM_ID`].
    pub error_stream_id: i32,
    /// Service stream id carrying Join/More/Cancel and heartbeats.
    /// Default [`DEFAULT_SERVICE_REQUEST_STREAM_ID`].
    pub service_request_stream_id: i32,
    /// Capacity of the outbound signal ring. Default
    /// [`DEFAULT_RING_BUFFER_SIZE`].
    pub ring_buffer_size: usize,
    /// Pause between publication offer retries and demand re-checks.
    /// Default [`DEFAULT_PUBLICATION_RETRY`].
    pub publication_retry: Duration,
    /// Bound on back-pressure retries; also the grace period before a
    /// terminated publication closes. Default
    /// [`DEFAULT_PUBLICATION_LINGER_TIMEOUT`].
    pub publication_linger_timeout: Duration,
    /// Cancel the upstream subscription once the last remote session
    /// leaves. Default `true`.
    pub auto_cancel: bool,
    /// Allow concurrent producers. Set by
    /// [`Processor::share`](crate::Processor::share); `create` leaves it
    /// `false` and enforces the single-threaded producer contract.
    pub multi_publishers: bool,
    /// Launch the embedded driver on first use. When `false`, acquiring a
    /// manager that is not already started fails. Default `true`.
    pub launch_embedded_driver: bool,
    /// Interval between heartbeat probes toward senders. Default
    /// [`DEFAULT_HEARTBEAT_INTERVAL`].
    pub heartbeat_interval: Duration,
    /// Liveness bound: a silent session is reaped, a silent sender is
    /// reported as [`CoreError::TransportTimeout`]. Must exceed the
    /// interval. Default [`DEFAULT_HEARTBEAT_TIMEOUT`].
    pub heartbeat_timeout: Duration,
    /// Driver manager to acquire the transport from. `None` means the
    /// process-wide manager; tests inject fresh instances here.
    pub driver: Option<Arc<DriverManager>>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            name: "riffle".to_string(),
            sender_channel: "mem:riffle".to_string(),
            receiver_channel: "mem:riffle".to_string(),
            stream_id: DEFAULT_STREAM_ID,
            error_stream_id: DEFAULT_ERROR_STREAM_ID,
            service_request_stream_id: DEFAULT_SERVICE_REQUEST_STREAM_ID,
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            publication_retry: DEFAULT_PUBLICATION_RETRY,
            publication_linger_timeout: DEFAULT_PUBLICATION_LINGER_TIMEOUT,
            auto_cancel: true,
            multi_publishers: false,
            launch_embedded_driver: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            driver: None,
        }
    }
}

impl Context {
    /// A default context with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Check the configuration once at construction.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::Config("name must not be empty".to_string()));
        }
        if self.sender_channel.is_empty() || self.receiver_channel.is_empty() {
            return Err(CoreError::Config("channels must not be empty".to_string()));
        }
        if self.stream_id == self.error_stream_id
            || self.stream_id == self.service_request_stream_id
            || self.error_stream_id == self.service_request_stream_id
        {
            return Err(CoreError::Config(
                "stream, error and service stream ids must be pairwise distinct".to_string(),
            ));
        }
        if self.ring_buffer_size == 0 {
            return Err(CoreError::Config("ring buffer size must be positive".to_string()));
        }
        if self.publication_retry.is_zero() {
            return Err(CoreError::Config("publication retry must be positive".to_string()));
        }
        if self.publication_linger_timeout < self.publication_retry {
            return Err(CoreError::Config(
                "linger timeout must be at least one retry interval".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.heartbeat_timeout {
            return Err(CoreError::Config(
                "heartbeat interval must be positive and below the timeout".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("sender_channel", &self.sender_channel)
            .field("receiver_channel", &self.receiver_channel)
            .field("stream_id", &self.stream_id)
            .field("error_stream_id", &self.error_stream_id)
            .field("service_request_stream_id", &self.service_request_stream_id)
            .field("ring_buffer_size", &self.ring_buffer_size)
            .field("publication_retry", &self.publication_retry)
            .field("publication_linger_timeout", &self.publication_linger_timeout)
            .field("auto_cancel", &self.auto_cancel)
            .field("multi_publishers", &self.multi_publishers)
            .field("launch_embedded_driver", &self.launch_embedded_driver)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("driver", &self.driver.as_ref().map(|_| "injected"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_validates() {
        Context::new("test").validate().unwrap();
    }

    #[test]
    fn rejects_colliding_stream_ids() {
        let ctx = Context { error_stream_id: DEFAULT_STREAM_ID, ..Context::new("test") };
        assert!(matches!(ctx.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn rejects_empty_name_and_channels() {
        assert!(Context::new("").validate().is_err());

        let ctx = Context { sender_channel: String::new(), ..Context::new("test") };
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn rejects_zero_ring_and_inverted_heartbeat() {
        let ctx = Context { ring_buffer_size: 0, ..Context::new("test") };
        assert!(ctx.validate().is_err());

        let ctx = Context {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(1),
            ..Context::new("test")
        };
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn rejects_linger_below_retry() {
        let ctx = Context {
            publication_retry: Duration::from_millis(100),
            publication_linger_timeout: Duration::from_millis(10),
            ..Context::new("test")
        };
        assert!(ctx.validate().is_err());
    }
}
