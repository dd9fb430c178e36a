//! The broker boundary.
//!
//! Everything the clients need from a broker goes through [`Broker`]:
//! metadata, append, fetch, group membership and offset storage. The wire
//! protocol lives entirely inside an implementation of this trait.

use std::collections::BTreeSet;

use async_trait::async_trait;
use herald_core::{ConsumedRecord, GenerationId, MemberId, Offset, Record, TopicPartition};

use crate::error::BrokerResult;

/// Acknowledgment level for produce requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acks {
    /// No acknowledgment (fire and forget).
    None,
    /// Wait for the partition leader to write.
    #[default]
    Leader,
    /// Wait for all in-sync replicas.
    All,
}

/// Records returned by a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    /// Records in offset order.
    pub records: Vec<ConsumedRecord>,
    /// First retained offset of the partition.
    pub log_start_offset: Offset,
    /// Next offset the partition will assign.
    pub log_end_offset: Offset,
}

/// Retained range of a partition log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBounds {
    /// First retained offset.
    pub start: Offset,
    /// Next offset to be assigned.
    pub end: Offset,
}

/// A request to join (or rejoin) a consumer group.
#[derive(Debug, Clone)]
pub struct JoinGroupRequest {
    /// Consumer group name.
    pub group_id: String,
    /// Member ID from an earlier join, `None` for a fresh member.
    pub member_id: Option<MemberId>,
    /// Topics the member subscribes to.
    pub topics: BTreeSet<String>,
    /// Session timeout in microseconds.
    pub session_timeout_us: u64,
}

/// The partitions a member owns for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// The member.
    pub member_id: MemberId,
    /// The generation this assignment belongs to.
    pub generation: GenerationId,
    /// Partitions owned by the member, sorted.
    pub partitions: Vec<TopicPartition>,
}

/// Result of a join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The member is registered but other members have not rejoined yet.
    /// The client must call `join_group` again with the returned member ID.
    Pending {
        /// The member ID to rejoin with.
        member_id: MemberId,
    },
    /// The group is stable and this is the member's assignment.
    Complete(Assignment),
}

/// Result of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Nothing changed.
    Stable,
    /// Membership changed; the member must revoke its partitions and rejoin.
    RebalanceRequired,
}

/// A message broker as seen by the clients.
///
/// Implementations must be cheap to share (`Arc`) and safe to call from
/// many tasks at once.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Returns the number of partitions of a topic.
    async fn partition_count(&self, topic: &str) -> BrokerResult<u32>;

    /// Appends records to a partition, returning the offset of the first one.
    async fn append(
        &self,
        partition: &TopicPartition,
        records: Vec<Record>,
        acks: Acks,
    ) -> BrokerResult<Offset>;

    /// Reads up to `max_records` records starting at `from`.
    async fn fetch(
        &self,
        partition: &TopicPartition,
        from: Offset,
        max_records: u32,
    ) -> BrokerResult<FetchResponse>;

    /// Returns the retained range of a partition.
    async fn log_bounds(&self, partition: &TopicPartition) -> BrokerResult<LogBounds>;

    /// Joins or rejoins a consumer group.
    async fn join_group(&self, request: JoinGroupRequest) -> BrokerResult<JoinOutcome>;

    /// Keeps a member's session alive and reports pending rebalances.
    async fn heartbeat(
        &self,
        group_id: &str,
        member_id: MemberId,
        generation: GenerationId,
    ) -> BrokerResult<HeartbeatOutcome>;

    /// Leaves a consumer group, triggering a rebalance for the others.
    async fn leave_group(&self, group_id: &str, member_id: MemberId) -> BrokerResult<()>;

    /// Stores committed offsets for a group.
    async fn commit_offsets(
        &self,
        group_id: &str,
        member_id: MemberId,
        generation: GenerationId,
        offsets: &[(TopicPartition, Offset)],
    ) -> BrokerResult<()>;

    /// Returns a group's committed offset for a partition, if any.
    async fn committed_offset(
        &self,
        group_id: &str,
        partition: &TopicPartition,
    ) -> BrokerResult<Option<Offset>>;
}
