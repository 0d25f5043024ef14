//! Error types for the transport and its lifecycle manager.

use std::io;

use thiserror::Error;

/// Errors from the media driver and its handles.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The driver (or the handle) was already closed.
    #[error("transport closed")]
    Closed,

    /// The driver's scratch directory could not be created or removed.
    #[error("driver directory {path}: {source}")]
    Directory {
        /// The offending path.
        path: String,
        /// Underlying filesystem error.
        source: io::Error,
    },
}

/// Errors from [`DriverManager`](crate::DriverManager).
#[derive(Error, Debug)]
pub enum ManagerError {
    /// `acquire()` raced a pending shutdown. Callers retry once the
    /// manager has returned to `NotStarted`, or give up.
    #[error("driver manager is shutting down")]
    ShuttingDown,

    /// Launching the embedded driver failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_wraps_into_manager_error() {
        let err: ManagerError = TransportError::Closed.into();
        assert!(matches!(err, ManagerError::Transport(TransportError::Closed)));
    }
}
