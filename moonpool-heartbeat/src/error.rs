//! Error types for beacon and monitor operations.

use std::fmt;
use std::io;
use thiserror::Error;

/// Errors returned to the caller of a [`Beacon`](crate::Beacon) or
/// [`Monitor`](crate::Monitor) operation.
///
/// Transport failures that happen *while running* are not returned here:
/// they close the instance and surface as a [`CloseReason`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatError {
    /// The transport could not be established.
    #[error("connection error on {name}: {message}")]
    Connection {
        /// Instance the connection was meant for.
        name: String,
        /// Details from the dial/accept layer.
        message: String,
    },

    /// `run()` was called on an instance that is already running.
    #[error("{name} is already running")]
    AlreadyStarted {
        /// Instance name.
        name: String,
    },

    /// The instance has been closed and cannot be started again.
    #[error("{name} is closed")]
    Closed {
        /// Instance name.
        name: String,
    },

    /// `run()` was called outside a tokio runtime.
    #[error("{name} cannot run outside a tokio runtime")]
    NoRuntime {
        /// Instance name.
        name: String,
    },
}

impl HeartbeatError {
    /// Wrap a dial/accept failure for the named instance.
    pub fn connection(name: &str, error: io::Error) -> Self {
        HeartbeatError::Connection {
            name: name.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type for beacon and monitor operations.
pub type HeartbeatResult<T> = Result<T, HeartbeatError>;

/// Why an instance closed.
///
/// Published exactly once per instance through `closed()`. Timeouts are
/// never a reason on their own; only crossing the miss threshold is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Shutdown,

    /// Writing the marker failed (peer reset, broken pipe).
    WriteFailed(String),

    /// Reading from the connection failed.
    ReadFailed(String),

    /// The beacon reached its lifetime bound.
    LifetimeElapsed,

    /// Consecutive misses went over the monitor threshold.
    ThresholdExceeded {
        /// Consecutive misses at the time of closing.
        misses: u32,
        /// Threshold in effect when the last miss was counted.
        threshold: u32,
    },
}

impl CloseReason {
    /// True when the instance closed because the peer or the transport
    /// is considered dead, as opposed to a requested or planned stop.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CloseReason::WriteFailed(_)
                | CloseReason::ReadFailed(_)
                | CloseReason::ThresholdExceeded { .. }
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown requested"),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {}", e),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            CloseReason::LifetimeElapsed => write!(f, "lifetime elapsed"),
            CloseReason::ThresholdExceeded { misses, threshold } => {
                write!(f, "{} consecutive misses exceeded threshold {}", misses, threshold)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_keeps_io_message() {
        let err = HeartbeatError::connection(
            "beacon-a",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(err.to_string(), "connection error on beacon-a: refused");
    }

    #[test]
    fn test_close_reason_failure_classification() {
        assert!(!CloseReason::Shutdown.is_failure());
        assert!(!CloseReason::LifetimeElapsed.is_failure());
        assert!(CloseReason::WriteFailed("broken pipe".into()).is_failure());
        assert!(CloseReason::ReadFailed("reset".into()).is_failure());
        assert!(
            CloseReason::ThresholdExceeded {
                misses: 3,
                threshold: 2
            }
            .is_failure()
        );
    }

    #[test]
    fn test_close_reason_display() {
        let reason = CloseReason::ThresholdExceeded {
            misses: 2,
            threshold: 1,
        };
        assert_eq!(
            reason.to_string(),
            "2 consecutive misses exceeded threshold 1"
        );
    }
}
