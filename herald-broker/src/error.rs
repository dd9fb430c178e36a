//! Broker error types.

use herald_core::{BrokerErrorKind, GenerationId, MemberId, Offset, TopicPartition};
use thiserror::Error;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors a broker can return to a client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The request never reached the broker, or the answer never came back.
    #[error("{operation} failed: {kind:?}")]
    Transport {
        /// What went wrong on the wire.
        kind: BrokerErrorKind,
        /// The request that failed.
        operation: &'static str,
    },

    /// The topic does not exist.
    #[error("unknown topic: {topic}")]
    UnknownTopic {
        /// The topic name.
        topic: String,
    },

    /// The partition does not exist in the topic.
    #[error("unknown partition: {partition}")]
    UnknownPartition {
        /// The missing partition.
        partition: TopicPartition,
    },

    /// Fetch offset is outside the retained log.
    #[error("offset {offset} out of range for {partition} [{log_start}, {log_end})")]
    OffsetOutOfRange {
        /// The partition.
        partition: TopicPartition,
        /// Requested offset.
        offset: Offset,
        /// First retained offset.
        log_start: Offset,
        /// Next offset to be assigned.
        log_end: Offset,
    },

    /// Record exceeds the broker's maximum message size.
    #[error("record too large: {size} > {max} bytes")]
    RecordTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The member is not (or no longer) part of the group.
    #[error("member {member_id} unknown in group {group_id}")]
    UnknownMember {
        /// The consumer group.
        group_id: String,
        /// The member that was not found.
        member_id: MemberId,
    },

    /// The request carried a generation that is not the group's current one.
    #[error("illegal generation {generation} for group {group_id} (current {current})")]
    IllegalGeneration {
        /// The consumer group.
        group_id: String,
        /// Generation sent by the client.
        generation: GenerationId,
        /// Generation held by the coordinator.
        current: GenerationId,
    },

    /// The group reached its member limit.
    #[error("group {group_id} is full ({max} members)")]
    GroupFull {
        /// The consumer group.
        group_id: String,
        /// Maximum allowed members.
        max: u32,
    },

    /// The request is malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Why it was rejected.
        reason: &'static str,
    },
}

impl BrokerError {
    /// Creates an "unreachable" transport error for the given operation.
    #[must_use]
    pub const fn unreachable(operation: &'static str) -> Self {
        Self::Transport {
            kind: BrokerErrorKind::Unreachable,
            operation,
        }
    }

    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the error means the client lost its group membership.
    #[must_use]
    pub const fn is_membership_lost(&self) -> bool {
        matches!(
            self,
            Self::UnknownMember { .. } | Self::IllegalGeneration { .. }
        )
    }
}
