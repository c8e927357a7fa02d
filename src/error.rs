//! Error types for the reactor.
//!
//! Two layers, matching how failures propagate:
//!
//! - [`OpError`] travels *with* an operation: the reactor attaches it to
//!   the affected op and delivers the op through the executor as a
//!   completion carrying the error. Nothing is raised across the reactor
//!   boundary for per-operation failures.
//! - [`Error`] is reactor-level. Construction failure of the kernel
//!   multiplexer is the only hard failure of the whole reactor; the rest
//!   cover registry exhaustion and use after shutdown.
//!
//! No retry exists anywhere in this crate. Re-attempting a read after
//! would-block is the responsibility of the operation's own `perform`
//! step, which the reactor re-invokes on every readiness notification.

use std::io;
use thiserror::Error;

/// Failure attached to an individual operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpError {
    /// The operation was submitted through an unregistered or nulled
    /// descriptor handle. No kernel interaction took place.
    #[error("bad descriptor")]
    BadDescriptor,

    /// The operation was cancelled, or its descriptor was closed, or the
    /// reactor shut down while it was queued.
    #[error("operation aborted")]
    Aborted,

    /// A kernel registration or delivery failure, carrying the raw
    /// OS error code.
    #[error("os error {0}")]
    Os(i32),
}

impl OpError {
    /// Converts the error into an [`io::Error`].
    #[must_use]
    pub fn into_io(self) -> io::Error {
        match self {
            Self::BadDescriptor => io::Error::from(io::ErrorKind::NotFound),
            Self::Aborted => io::Error::from(io::ErrorKind::Interrupted),
            Self::Os(code) => io::Error::from_raw_os_error(code),
        }
    }
}

/// Reactor-level failure.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel event multiplexer could not be created. This is fatal
    /// to the whole reactor and is never retried.
    #[error("failed to create kernel event multiplexer")]
    Create(#[source] io::Error),

    /// The descriptor registry is at capacity. Resource exhaustion is
    /// reported to the caller and never retried internally.
    #[error("descriptor registry exhausted")]
    Exhausted,

    /// The reactor has been shut down; no new descriptors are accepted.
    #[error("reactor is shut down")]
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_error_display() {
        assert_eq!(OpError::BadDescriptor.to_string(), "bad descriptor");
        assert_eq!(OpError::Aborted.to_string(), "operation aborted");
        assert_eq!(OpError::Os(98).to_string(), "os error 98");
    }

    #[test]
    fn os_error_round_trips_errno() {
        let io_err = OpError::Os(13).into_io();
        assert_eq!(io_err.raw_os_error(), Some(13));
    }

    #[test]
    fn create_error_carries_source() {
        let err = Error::Create(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(std::error::Error::source(&err).is_some());
    }
}
