//! Client error types.

use herald_broker::BrokerError;
use herald_core::{Offset, RecordError, TopicPartition};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// How an error should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Expected to clear on its own; retried with backoff.
    Transient,
    /// A malformed or unprocessable record; skipped and logged, never retried.
    Data,
    /// Invalid configuration; fatal at construction.
    Configuration,
    /// The client cannot continue (closed, retries exhausted).
    Terminal,
}

/// Errors surfaced by the producer and consumer clients.
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    /// The broker could not be reached for an operation.
    #[error("broker unreachable during {operation}")]
    BrokerUnreachable {
        /// The operation that failed.
        operation: &'static str,
    },

    /// A record could not be delivered after exhausting its retries.
    #[error("delivery failed after {attempts} attempts: {source}")]
    DeliveryFailed {
        /// Attempts made.
        attempts: u32,
        /// The last broker error.
        #[source]
        source: BrokerError,
    },

    /// The consumer could not make progress after exhausting its retries.
    #[error("consumption stalled after {attempts} attempts: {source}")]
    ConsumptionStalled {
        /// Attempts made.
        attempts: u32,
        /// The last broker error.
        #[source]
        source: BrokerError,
    },

    /// A key or value could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[source] CodecError),

    /// A consumed value could not be deserialized.
    #[error("deserialization failed at {partition}@{offset}: {source}")]
    Deserialization {
        /// The partition.
        partition: TopicPartition,
        /// Offset of the undecodable record.
        offset: Offset,
        /// Why decoding failed.
        #[source]
        source: CodecError,
    },

    /// The record exceeds the maximum size.
    #[error("record too large: {size} > {max} bytes")]
    RecordTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The record is malformed.
    #[error("invalid record: {0}")]
    InvalidRecord(#[source] RecordError),

    /// A configuration value is invalid.
    #[error("invalid configuration '{name}': {reason}")]
    Configuration {
        /// The offending setting.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The message handler failed.
    #[error("handler failed at {partition}@{offset}: {message}")]
    Handler {
        /// The partition.
        partition: TopicPartition,
        /// Offset of the failed record.
        offset: Offset,
        /// The handler's error message.
        message: String,
    },

    /// Too many records are waiting for delivery.
    #[error("producer buffer full ({capacity} records in flight)")]
    BufferFull {
        /// Configured capacity.
        capacity: u32,
    },

    /// An offset commit was rejected locally.
    #[error(transparent)]
    Commit(#[from] CommitError),

    /// The client has been closed.
    #[error("client closed")]
    Closed,

    /// A broker error that is not covered by a more specific variant.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl ClientError {
    /// Classifies the error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::BrokerUnreachable { .. } | Self::BufferFull { .. } => ErrorCategory::Transient,
            Self::Serialization(_)
            | Self::Deserialization { .. }
            | Self::RecordTooLarge { .. }
            | Self::InvalidRecord(_)
            | Self::Handler { .. } => ErrorCategory::Data,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::DeliveryFailed { .. }
            | Self::ConsumptionStalled { .. }
            | Self::Commit(_)
            | Self::Closed => ErrorCategory::Terminal,
            Self::Broker(err) => match err {
                BrokerError::Transport { .. }
                | BrokerError::UnknownMember { .. }
                | BrokerError::IllegalGeneration { .. } => ErrorCategory::Transient,
                BrokerError::RecordTooLarge { .. } | BrokerError::OffsetOutOfRange { .. } => {
                    ErrorCategory::Data
                }
                BrokerError::UnknownTopic { .. }
                | BrokerError::UnknownPartition { .. }
                | BrokerError::GroupFull { .. }
                | BrokerError::InvalidRequest { .. } => ErrorCategory::Configuration,
            },
        }
    }

    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }

    pub(crate) fn configuration(name: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            name,
            reason: reason.into(),
        }
    }

    /// Maps a record validation failure.
    pub(crate) fn from_record_error(err: RecordError) -> Self {
        match err {
            RecordError::TooLarge { size, max } => Self::RecordTooLarge { size, max },
            other => Self::InvalidRecord(other),
        }
    }

    /// Maps the final error of a retried broker call made by the producer.
    pub(crate) fn delivery(err: BrokerError, attempts: u32) -> Self {
        match err {
            BrokerError::RecordTooLarge { size, max } => Self::RecordTooLarge { size, max },
            err if err.is_retryable() => Self::DeliveryFailed {
                attempts,
                source: err,
            },
            err => Self::Broker(err),
        }
    }
}

impl From<herald_core::Error> for ClientError {
    fn from(err: herald_core::Error) -> Self {
        match err {
            herald_core::Error::InvalidArgument { name, reason } => {
                Self::configuration(name, reason)
            }
            herald_core::Error::LimitExceeded { limit, max, actual } => {
                Self::configuration(limit, format!("{actual} exceeds maximum {max}"))
            }
        }
    }
}

/// Errors raised by serializers and deserializers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Bytes were not valid UTF-8.
    #[error("invalid utf-8: {reason}")]
    InvalidUtf8 {
        /// Decoder message.
        reason: String,
    },

    /// JSON encoding or decoding failed.
    #[error("json: {reason}")]
    Json {
        /// Encoder or decoder message.
        reason: String,
    },

    /// Any other codec failure.
    #[error("{0}")]
    Custom(String),
}

/// Errors raised by the commit coordinator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// The partition is not assigned to this consumer.
    #[error("partition {partition} is not assigned")]
    NotAssigned {
        /// The partition.
        partition: TopicPartition,
    },

    /// The offset is below the last committed offset.
    #[error("commit of {offset} for {partition} would regress from {committed}")]
    Regression {
        /// The partition.
        partition: TopicPartition,
        /// Requested offset.
        offset: Offset,
        /// Last committed offset.
        committed: Offset,
    },

    /// The offset is past everything delivered to the handler.
    #[error("commit of {offset} for {partition} is past the delivered position {delivered}")]
    BeyondDelivered {
        /// The partition.
        partition: TopicPartition,
        /// Requested offset.
        offset: Offset,
        /// One past the highest delivered offset.
        delivered: Offset,
    },

    /// The consumer holds no group membership to commit under.
    #[error("no active group membership")]
    NoMembership,
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::{BrokerErrorKind, PartitionId};

    #[test]
    fn test_categories() {
        assert_eq!(
            ClientError::BrokerUnreachable { operation: "append" }.category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            ClientError::InvalidRecord(RecordError::EmptyTopic).category(),
            ErrorCategory::Data
        );
        assert_eq!(
            ClientError::configuration("worker_count", "must be positive").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(ClientError::Closed.category(), ErrorCategory::Terminal);
        assert_eq!(
            ClientError::Broker(BrokerError::UnknownTopic { topic: "t".into() }).category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_delivery_mapping() {
        let exhausted = ClientError::delivery(BrokerError::unreachable("append"), 3);
        assert!(matches!(exhausted, ClientError::DeliveryFailed { attempts: 3, .. }));
        assert_eq!(exhausted.category(), ErrorCategory::Terminal);

        let too_large = ClientError::delivery(BrokerError::RecordTooLarge { size: 10, max: 5 }, 1);
        assert!(matches!(too_large, ClientError::RecordTooLarge { size: 10, max: 5 }));

        let reset = ClientError::Broker(BrokerError::Transport {
            kind: BrokerErrorKind::ConnectionReset,
            operation: "fetch",
        });
        assert!(reset.is_retryable());
    }

    #[test]
    fn test_record_error_mapping() {
        let err = ClientError::from_record_error(RecordError::TooLarge { size: 9, max: 8 });
        assert!(matches!(err, ClientError::RecordTooLarge { size: 9, max: 8 }));
    }

    #[test]
    fn test_display() {
        let err = ClientError::Handler {
            partition: TopicPartition::new("t", PartitionId::new(0)),
            offset: Offset::new(5),
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "handler failed at t/0@5: boom");
    }
}
