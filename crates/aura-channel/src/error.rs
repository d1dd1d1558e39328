//! Channel-layer errors
//!
//! A single error type covers every failure the channel layer can surface.
//! Each variant belongs to one [`ErrorClass`], which is what the binder's
//! masking logic and the synchronizer's fault tolerance consult.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unified error type for channel, synchronizer and binder operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ChannelError {
    /// Operation requires an open object but it has not finished opening
    #[error("{object} is not open")]
    NotOpen {
        /// Object the operation was invoked on
        object: String,
    },

    /// Operation is not valid in the object's current state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Error message describing the forbidden transition
        message: String,
    },

    /// Object was aborted before or during the operation
    #[error("{object} was aborted")]
    Aborted {
        /// Object that was aborted
        object: String,
    },

    /// Object was closed before or during the operation
    #[error("{object} has been closed")]
    Closed {
        /// Object that was closed
        object: String,
    },

    /// Object is in the faulted state
    #[error("{object} is in the faulted state")]
    Faulted {
        /// Object that faulted
        object: String,
    },

    /// Operation did not complete within its time budget
    #[error("Timed out: {operation} did not complete within {timeout:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Budget the operation was given
        timeout: Duration,
    },

    /// Transport-level communication failure
    #[error("Communication error: {message}")]
    Communication {
        /// Error message describing the communication failure
        message: String,
    },

    /// Malformed or semantically invalid exchange
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message describing the protocol violation
        message: String,
    },

    /// Caller supplied an invalid argument
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Error message describing the invalid argument
        message: String,
    },
}

/// Classification used by masking and fault tolerance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Caller misuse: operation invoked in a state that forbids it
    Lifecycle,
    /// Communication failure or timeout, eligible for masking
    Handleable,
    /// Protocol violation, never maskable
    Protocol,
    /// Object already reached a terminal state (aborted, closed, faulted)
    Terminal,
}

impl ChannelError {
    /// Create a not-open error for `object`
    pub fn not_open(object: impl Into<String>) -> Self {
        Self::NotOpen {
            object: object.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an aborted error for `object`
    pub fn aborted(object: impl Into<String>) -> Self {
        Self::Aborted {
            object: object.into(),
        }
    }

    /// Create a closed error for `object`
    pub fn closed(object: impl Into<String>) -> Self {
        Self::Closed {
            object: object.into(),
        }
    }

    /// Create a faulted error for `object`
    pub fn faulted(object: impl Into<String>) -> Self {
        Self::Faulted {
            object: object.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a communication error
    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Error class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotOpen { .. } | Self::InvalidState { .. } | Self::InvalidArgument { .. } => {
                ErrorClass::Lifecycle
            }
            Self::Aborted { .. } | Self::Closed { .. } | Self::Faulted { .. } => {
                ErrorClass::Terminal
            }
            Self::Timeout { .. } | Self::Communication { .. } => ErrorClass::Handleable,
            Self::Protocol { .. } => ErrorClass::Protocol,
        }
    }

    /// Whether this is a communication or timeout failure
    pub fn is_handleable(&self) -> bool {
        self.class() == ErrorClass::Handleable
    }

    /// Whether this error reports that the operation ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Standard result type for channel operations
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Named constructors for the errors transport collaborators raise
///
/// Physical channels and factories use these so the binder can classify
/// their failures without inspecting messages.
pub struct ChannelErrorBuilder;

impl ChannelErrorBuilder {
    /// Create a connection failed error
    pub fn connection_failed(reason: impl Into<String>) -> ChannelError {
        ChannelError::communication(format!("Connection failed: {}", reason.into()))
    }

    /// Create a connection reset error
    pub fn connection_reset(peer: impl Into<String>) -> ChannelError {
        ChannelError::communication(format!("Connection reset by {}", peer.into()))
    }

    /// Create a network timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> ChannelError {
        ChannelError::timeout(operation, timeout)
    }

    /// Create a malformed message error
    pub fn malformed_message(reason: impl Into<String>) -> ChannelError {
        ChannelError::protocol(format!("Malformed message: {}", reason.into()))
    }

    /// Create an unexpected message error
    pub fn unexpected_message(expected: &str, actual: &str) -> ChannelError {
        ChannelError::protocol(format!("Expected {expected}, received {actual}"))
    }
}
