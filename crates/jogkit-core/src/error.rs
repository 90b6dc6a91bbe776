//! Error handling for JogKit
//!
//! Provides the error taxonomy shared by every layer of the control core:
//! - Connection errors (transport open/close/timeout failures)
//! - Command errors (malformed or rejected commands, dispatch timeouts)
//! - Bounds errors (soft-limit violations)
//! - Validation rejections (operation in progress, machine not ready)
//! - Fatal errors (transport lost mid-queue)
//!
//! All error types use `thiserror` for ergonomic error handling.

use crate::data::{Axis, BoundSide, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Connection error type
///
/// Represents failures of the transport to the physical controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    OpenFailed {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Connection timeout
    #[error("Connection to {port} timed out after {timeout_ms}ms")]
    Timeout {
        /// The port being opened.
        port: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Connection was closed while the command was still queued
    #[error("Connection closed")]
    ConnectionClosed,

    /// A connection is already open or being opened
    #[error("Already connected to {port}")]
    AlreadyConnected {
        /// The port currently in use.
        port: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

/// Command error type
///
/// Represents failures of a single command. These never halt the queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Command was rejected by the controller
    #[error("Command '{command}' rejected (error:{code}): {message}")]
    Rejected {
        /// The rejected command text.
        command: String,
        /// Controller error code.
        code: u8,
        /// Decoded error message.
        message: String,
    },

    /// No acknowledgment arrived in time
    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The command text.
        command: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Command text or parameters are invalid
    #[error("Malformed command: {reason}")]
    Malformed {
        /// Why the command was refused.
        reason: String,
    },

    /// Queue is at capacity
    #[error("Command queue is full ({capacity} commands)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Command was removed from the queue before dispatch
    #[error("Command '{command}' cancelled: {reason}")]
    Cancelled {
        /// The command text.
        command: String,
        /// Why it was cancelled.
        reason: String,
    },
}

/// Soft-limit violation
#[derive(Error, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[error("Soft limit exceeded on {axis}: target {target:.3} is beyond the {bound} bound {limit:.3}")]
pub struct BoundsError {
    /// The offending axis.
    pub axis: Axis,
    /// Which bound was crossed.
    pub bound: BoundSide,
    /// The rejected target coordinate.
    pub target: f64,
    /// The limit that was crossed.
    pub limit: f64,
}

/// Stable classification of every error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Transport open/close/timeout failures.
    Connection,
    /// Malformed, rejected, timed-out or cancelled commands.
    Command,
    /// Soft-limit violation.
    Bounds,
    /// A jog or homing operation is already active.
    OperationInProgress,
    /// Machine is in alarm or disconnected.
    MachineNotReady,
    /// Unrecoverable transport loss.
    Fatal,
    /// Invalid configuration.
    Config,
    /// Underlying I/O failure.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connection => "ConnectionError",
            Self::Command => "CommandError",
            Self::Bounds => "BoundsError",
            Self::OperationInProgress => "OperationInProgress",
            Self::MachineNotReady => "MachineNotReady",
            Self::Fatal => "Fatal",
            Self::Config => "ConfigError",
            Self::Io => "IoError",
        };
        write!(f, "{}", name)
    }
}

/// Main error type for JogKit
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Command error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Soft-limit violation
    #[error(transparent)]
    Bounds(#[from] BoundsError),

    /// Concurrent jog/homing attempted
    #[error("Operation in progress: {operation}")]
    OperationInProgress {
        /// The operation that currently owns the machine.
        operation: Operation,
    },

    /// Machine cannot accept motion right now
    #[error("Machine not ready: {reason}")]
    MachineNotReady {
        /// Why the machine refused the request.
        reason: String,
    },

    /// Transport became unusable while commands were queued
    #[error("Fatal: {reason}")]
    Fatal {
        /// The underlying failure.
        reason: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a machine-not-ready rejection
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Error::MachineNotReady {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config(reason.into())
    }

    /// Create a malformed-command error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::Command(CommandError::Malformed {
            reason: reason.into(),
        })
    }

    /// Stable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::Command(_) => ErrorKind::Command,
            Error::Bounds(_) => ErrorKind::Bounds,
            Error::OperationInProgress { .. } => ErrorKind::OperationInProgress,
            Error::MachineNotReady { .. } => ErrorKind::MachineNotReady,
            Error::Fatal { .. } => ErrorKind::Fatal,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Command(CommandError::Timeout { .. })
                | Error::Connection(ConnectionError::Timeout { .. })
        )
    }

    /// Check if this error makes the transport unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Fatal { .. } | Error::Connection(ConnectionError::ConnectionLost { .. })
        )
    }

    /// Check if this is a synchronous validation rejection
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Bounds | ErrorKind::OperationInProgress | ErrorKind::MachineNotReady
        )
    }

    /// Duplicate this error for fan-out to several waiters
    ///
    /// `std::io::Error` is not `Clone`; it is carried over by kind and message.
    pub fn duplicate(&self) -> Self {
        match self {
            Error::Connection(e) => Error::Connection(e.clone()),
            Error::Command(e) => Error::Command(e.clone()),
            Error::Bounds(e) => Error::Bounds(*e),
            Error::OperationInProgress { operation } => Error::OperationInProgress {
                operation: *operation,
            },
            Error::MachineNotReady { reason } => Error::MachineNotReady {
                reason: reason.clone(),
            },
            Error::Fatal { reason } => Error::Fatal {
                reason: reason.clone(),
            },
            Error::Config(reason) => Error::Config(reason.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let bounds = Error::from(BoundsError {
            axis: Axis::X,
            bound: BoundSide::Max,
            target: 305.0,
            limit: 300.0,
        });
        assert_eq!(bounds.kind(), ErrorKind::Bounds);
        assert!(bounds.is_rejection());
        assert!(bounds.to_string().contains("max"));

        let busy = Error::OperationInProgress {
            operation: Operation::Homing,
        };
        assert_eq!(busy.kind(), ErrorKind::OperationInProgress);

        let closed = Error::from(ConnectionError::ConnectionClosed);
        assert_eq!(closed.kind(), ErrorKind::Connection);
        assert!(!closed.is_rejection());
    }

    #[test]
    fn test_timeout_classification() {
        let err = Error::from(CommandError::Timeout {
            command: "G0 X1".to_string(),
            timeout_ms: 500,
        });
        assert!(err.is_timeout());
        assert!(!err.is_fatal());

        let lost = Error::from(ConnectionError::ConnectionLost {
            reason: "unplugged".to_string(),
        });
        assert!(lost.is_fatal());
    }

    #[test]
    fn test_duplicate_preserves_kind() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        let copy = io.duplicate();
        assert_eq!(copy.kind(), ErrorKind::Io);
        assert!(copy.to_string().contains("pipe"));
    }
}
