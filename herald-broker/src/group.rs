//! Consumer group coordination.
//!
//! The `GroupCoordinator` owns membership, generations, partition
//! assignments and committed offsets for every group a broker hosts.
//!
//! # Protocol
//!
//! 1. A member calls `join`. A new or changed member moves the group to
//!    `PreparingRebalance`.
//! 2. Existing members learn about the rebalance from `heartbeat`, revoke
//!    their partitions, commit, and call `join` again.
//! 3. Once every live member has rejoined (members whose session expired
//!    are evicted), the generation is bumped, a fresh assignment is computed
//!    and the group is `Stable`. Each member receives its share from `join`.
//!
//! Assignments are only handed out while `Stable`, so two members never own
//! the same partition in the same generation. Offset commits are accepted
//! from members of the current generation, including during
//! `PreparingRebalance` so revoking members can flush their progress.
//!
//! The coordinator does no background work: time is passed in explicitly
//! (`current_time_us`) and session expiry is evaluated on every call.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use herald_core::{GenerationId, MemberId, Offset, TopicPartition};
use tracing::{debug, info};

use crate::assignor::{AssignmentStrategy, MemberAssignments, PartitionAssignor, Subscriptions};
use crate::broker::{Assignment, HeartbeatOutcome, JoinGroupRequest, JoinOutcome};
use crate::error::{BrokerError, BrokerResult};

/// Lifecycle phase of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    /// No members.
    Empty,
    /// Waiting for members to rejoin.
    PreparingRebalance,
    /// Every member holds an assignment for the current generation.
    Stable,
}

/// A member of a group.
#[derive(Debug, Clone)]
struct Member {
    topics: BTreeSet<String>,
    session_timeout_us: u64,
    last_seen_us: u64,
    rejoined: bool,
}

impl Member {
    const fn is_expired_at(&self, current_time_us: u64) -> bool {
        current_time_us.saturating_sub(self.last_seen_us) > self.session_timeout_us
    }
}

/// State of one consumer group.
#[derive(Debug, Clone)]
struct Group {
    generation: GenerationId,
    phase: GroupPhase,
    members: BTreeMap<MemberId, Member>,
    assignments: MemberAssignments,
    offsets: HashMap<TopicPartition, Offset>,
}

impl Group {
    fn new() -> Self {
        Self {
            generation: GenerationId::new(0),
            phase: GroupPhase::Empty,
            members: BTreeMap::new(),
            assignments: BTreeMap::new(),
            offsets: HashMap::new(),
        }
    }

    fn begin_rebalance(&mut self) {
        self.assignments.clear();
        if self.members.is_empty() {
            self.phase = GroupPhase::Empty;
            return;
        }
        self.phase = GroupPhase::PreparingRebalance;
        for member in self.members.values_mut() {
            member.rejoined = false;
        }
    }

    fn subscribed_topics(&self) -> BTreeSet<String> {
        self.members
            .values()
            .flat_map(|m| m.topics.iter().cloned())
            .collect()
    }
}

/// Read-only view of a group, for inspection and invariant checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    /// Current generation.
    pub generation: GenerationId,
    /// Current phase.
    pub phase: GroupPhase,
    /// Member IDs, sorted.
    pub members: Vec<MemberId>,
    /// Topics subscribed by at least one member.
    pub topics: BTreeSet<String>,
    /// Assignment per member (empty unless `Stable`).
    pub assignments: MemberAssignments,
}

/// Coordinates consumer groups.
pub struct GroupCoordinator {
    groups: HashMap<String, Group>,
    assignor: Box<dyn PartitionAssignor>,
    next_member_id: MemberId,
    max_members_per_group: u32,
}

impl std::fmt::Debug for GroupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCoordinator")
            .field("groups", &self.groups.len())
            .field("assignor", &self.assignor.name())
            .finish_non_exhaustive()
    }
}

impl GroupCoordinator {
    /// Creates a coordinator using the given assignment strategy.
    #[must_use]
    pub fn new(strategy: AssignmentStrategy, max_members_per_group: u32) -> Self {
        Self {
            groups: HashMap::new(),
            assignor: strategy.assignor(),
            next_member_id: MemberId::new(1),
            max_members_per_group,
        }
    }

    /// Handles a join request.
    ///
    /// `partition_counts` must hold the partition count of every topic the
    /// group subscribes to; it is only consulted when an assignment is
    /// computed.
    ///
    /// # Errors
    /// Returns `UnknownMember` for a stale member ID, `GroupFull` when the
    /// member limit is reached, `InvalidRequest` for an empty subscription.
    pub fn join(
        &mut self,
        request: &JoinGroupRequest,
        partition_counts: &BTreeMap<String, u32>,
        current_time_us: u64,
    ) -> BrokerResult<JoinOutcome> {
        if request.group_id.is_empty() {
            return Err(BrokerError::InvalidRequest {
                reason: "group id must not be empty",
            });
        }
        if request.topics.is_empty() {
            return Err(BrokerError::InvalidRequest {
                reason: "subscription must name at least one topic",
            });
        }

        let max_members = self.max_members_per_group;
        let group = self
            .groups
            .entry(request.group_id.clone())
            .or_insert_with(Group::new);
        Self::expire_members(&request.group_id, group, current_time_us);

        let member_id = match request.member_id {
            Some(member_id) => {
                let Some(member) = group.members.get_mut(&member_id) else {
                    return Err(BrokerError::UnknownMember {
                        group_id: request.group_id.clone(),
                        member_id,
                    });
                };
                member.last_seen_us = current_time_us;
                member.session_timeout_us = request.session_timeout_us;
                if member.topics != request.topics {
                    member.topics = request.topics.clone();
                    group.begin_rebalance();
                    info!(group_id = %request.group_id, member_id = %member_id, "Subscription changed, rebalancing");
                }
                member_id
            }
            None => {
                if u32::try_from(group.members.len()).unwrap_or(u32::MAX) >= max_members {
                    return Err(BrokerError::GroupFull {
                        group_id: request.group_id.clone(),
                        max: max_members,
                    });
                }
                let member_id = self.next_member_id;
                self.next_member_id = member_id.next();
                group.members.insert(
                    member_id,
                    Member {
                        topics: request.topics.clone(),
                        session_timeout_us: request.session_timeout_us,
                        last_seen_us: current_time_us,
                        rejoined: false,
                    },
                );
                group.begin_rebalance();
                info!(group_id = %request.group_id, member_id = %member_id, "Member joined, rebalancing");
                member_id
            }
        };

        if group.phase == GroupPhase::Stable {
            return Ok(JoinOutcome::Complete(Self::assignment_for(group, member_id)));
        }

        if let Some(member) = group.members.get_mut(&member_id) {
            member.rejoined = true;
        }

        if group.members.values().all(|m| m.rejoined) {
            let subscriptions: Subscriptions = group
                .members
                .iter()
                .map(|(&id, m)| (id, m.topics.clone()))
                .collect();
            let counts: BTreeMap<String, u32> = group
                .subscribed_topics()
                .into_iter()
                .filter_map(|t| partition_counts.get(&t).map(|&c| (t, c)))
                .collect();

            group.generation = group.generation.next();
            group.assignments = self.assignor.assign(&subscriptions, &counts);
            group.phase = GroupPhase::Stable;

            info!(
                group_id = %request.group_id,
                generation = %group.generation,
                members = group.members.len(),
                assignor = self.assignor.name(),
                "Group stable"
            );
            return Ok(JoinOutcome::Complete(Self::assignment_for(group, member_id)));
        }

        debug!(group_id = %request.group_id, member_id = %member_id, "Waiting for members to rejoin");
        Ok(JoinOutcome::Pending { member_id })
    }

    /// Handles a heartbeat.
    ///
    /// # Errors
    /// Returns `UnknownMember` if the member is not part of the group (for
    /// example after its session expired).
    pub fn heartbeat(
        &mut self,
        group_id: &str,
        member_id: MemberId,
        generation: GenerationId,
        current_time_us: u64,
    ) -> BrokerResult<HeartbeatOutcome> {
        let group = self.live_group(group_id, member_id, current_time_us)?;
        if let Some(member) = group.members.get_mut(&member_id) {
            member.last_seen_us = current_time_us;
        }

        if group.phase != GroupPhase::Stable || group.generation != generation {
            return Ok(HeartbeatOutcome::RebalanceRequired);
        }
        Ok(HeartbeatOutcome::Stable)
    }

    /// Removes a member from its group.
    ///
    /// Leaving a group the member is not part of is a no-op.
    pub fn leave(&mut self, group_id: &str, member_id: MemberId, current_time_us: u64) {
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        Self::expire_members(group_id, group, current_time_us);
        if group.members.remove(&member_id).is_some() {
            group.begin_rebalance();
            info!(group_id = %group_id, member_id = %member_id, "Member left, rebalancing");
        }
    }

    /// Stores committed offsets.
    ///
    /// # Errors
    /// Returns `UnknownMember` for a member outside the group and
    /// `IllegalGeneration` for a stale generation.
    pub fn commit(
        &mut self,
        group_id: &str,
        member_id: MemberId,
        generation: GenerationId,
        offsets: &[(TopicPartition, Offset)],
        current_time_us: u64,
    ) -> BrokerResult<()> {
        let group = self.live_group(group_id, member_id, current_time_us)?;
        if group.generation != generation {
            return Err(BrokerError::IllegalGeneration {
                group_id: group_id.to_string(),
                generation,
                current: group.generation,
            });
        }

        for (partition, offset) in offsets {
            group.offsets.insert(partition.clone(), *offset);
        }
        debug!(group_id = %group_id, member_id = %member_id, count = offsets.len(), "Committed offsets");
        Ok(())
    }

    /// Returns a group's committed offset for a partition.
    #[must_use]
    pub fn committed(&self, group_id: &str, partition: &TopicPartition) -> Option<Offset> {
        self.groups
            .get(group_id)
            .and_then(|g| g.offsets.get(partition).copied())
    }

    /// Evicts expired members of a group without any member request.
    ///
    /// Returns the number of evicted members.
    pub fn expire(&mut self, group_id: &str, current_time_us: u64) -> usize {
        self.groups
            .get_mut(group_id)
            .map_or(0, |group| Self::expire_members(group_id, group, current_time_us))
    }

    /// Returns a snapshot of a group.
    #[must_use]
    pub fn snapshot(&self, group_id: &str) -> Option<GroupSnapshot> {
        self.groups.get(group_id).map(|group| GroupSnapshot {
            generation: group.generation,
            phase: group.phase,
            members: group.members.keys().copied().collect(),
            topics: group.subscribed_topics(),
            assignments: group.assignments.clone(),
        })
    }

    fn live_group(
        &mut self,
        group_id: &str,
        member_id: MemberId,
        current_time_us: u64,
    ) -> BrokerResult<&mut Group> {
        let unknown = || BrokerError::UnknownMember {
            group_id: group_id.to_string(),
            member_id,
        };
        let group = self.groups.get_mut(group_id).ok_or_else(unknown)?;
        Self::expire_members(group_id, group, current_time_us);
        if !group.members.contains_key(&member_id) {
            return Err(unknown());
        }
        Ok(group)
    }

    fn expire_members(group_id: &str, group: &mut Group, current_time_us: u64) -> usize {
        let expired: Vec<MemberId> = group
            .members
            .iter()
            .filter(|(_, m)| m.is_expired_at(current_time_us))
            .map(|(&id, _)| id)
            .collect();

        for member_id in &expired {
            group.members.remove(member_id);
            info!(group_id = %group_id, member_id = %member_id, "Member session expired");
        }
        if !expired.is_empty() {
            group.begin_rebalance();
        }
        expired.len()
    }

    fn assignment_for(group: &Group, member_id: MemberId) -> Assignment {
        Assignment {
            member_id,
            generation: group.generation,
            partitions: group
                .assignments
                .get(&member_id)
                .cloned()
                .unwrap_or_default(),
        }
    }
}
