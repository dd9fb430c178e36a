//! Error types for Herald core operations.
//!
//! All errors must be handled explicitly. No silent failures, no ignored errors.

use std::fmt;

/// The result type for Herald core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Herald core operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A resource limit was exceeded.
    LimitExceeded {
        /// Which limit was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The actual value that exceeded the limit.
        actual: u64,
    },

    /// An invalid argument was provided.
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },
}

/// Kinds of broker errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// No broker could be reached.
    Unreachable,
    /// The connection was reset mid-request.
    ConnectionReset,
    /// The broker rejected the request because it is too large.
    MessageTooLarge,
    /// The topic does not exist.
    UnknownTopic,
}

impl BrokerErrorKind {
    /// Returns true if the condition is expected to clear on its own.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Unreachable | Self::ConnectionReset)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LimitExceeded { limit, max, actual } => {
                write!(f, "limit exceeded: {limit} (max={max}, actual={actual})")
            }
            Self::InvalidArgument { name, reason } => {
                write!(f, "invalid argument '{name}': {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}
