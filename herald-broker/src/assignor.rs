//! Partition assignment strategies.
//!
//! An assignor maps every partition of every subscribed topic to exactly
//! one member subscribed to that topic. Both strategies are deterministic:
//! members and partitions are visited in sorted order.

use std::collections::{BTreeMap, BTreeSet};

use herald_core::{MemberId, PartitionId, TopicPartition};

/// Member subscriptions, keyed by member.
pub type Subscriptions = BTreeMap<MemberId, BTreeSet<String>>;

/// Partition ownership, keyed by member.
pub type MemberAssignments = BTreeMap<MemberId, Vec<TopicPartition>>;

/// Assigns partitions to group members.
pub trait PartitionAssignor: Send + Sync {
    /// Computes an assignment. Every member in `subscriptions` gets an entry,
    /// possibly empty. Topics missing from `partition_counts` are skipped.
    fn assign(
        &self,
        subscriptions: &Subscriptions,
        partition_counts: &BTreeMap<String, u32>,
    ) -> MemberAssignments;

    /// Returns the strategy name.
    fn name(&self) -> &'static str;
}

/// Built-in assignment strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentStrategy {
    /// Contiguous ranges of each topic's partitions per member.
    #[default]
    Range,
    /// Partitions of all topics dealt out one at a time.
    RoundRobin,
}

impl AssignmentStrategy {
    /// Returns the assignor implementing this strategy.
    #[must_use]
    pub fn assignor(self) -> Box<dyn PartitionAssignor> {
        match self {
            Self::Range => Box::new(RangeAssignor),
            Self::RoundRobin => Box::new(RoundRobinAssignor),
        }
    }
}

fn empty_assignments(subscriptions: &Subscriptions) -> MemberAssignments {
    subscriptions.keys().map(|&member| (member, Vec::new())).collect()
}

/// Range assignor: each topic's partitions are split into contiguous ranges,
/// the first `partitions % members` members getting one extra.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeAssignor;

impl PartitionAssignor for RangeAssignor {
    fn assign(
        &self,
        subscriptions: &Subscriptions,
        partition_counts: &BTreeMap<String, u32>,
    ) -> MemberAssignments {
        let mut assignments = empty_assignments(subscriptions);

        for (topic, &count) in partition_counts {
            let members: Vec<MemberId> = subscriptions
                .iter()
                .filter(|(_, topics)| topics.contains(topic))
                .map(|(&member, _)| member)
                .collect();

            if members.is_empty() || count == 0 {
                continue;
            }

            let count = count as usize;
            let per_member = count / members.len();
            let remainder = count % members.len();

            let mut next = 0usize;
            for (idx, member) in members.iter().enumerate() {
                let take = if idx < remainder {
                    per_member + 1
                } else {
                    per_member
                };
                let owned = assignments.entry(*member).or_default();
                for partition in next..next + take {
                    owned.push(TopicPartition::new(
                        topic.clone(),
                        PartitionId::new(partition as u64),
                    ));
                }
                next += take;
            }

            debug_assert_eq!(next, count);
        }

        for owned in assignments.values_mut() {
            owned.sort();
        }
        assignments
    }

    fn name(&self) -> &'static str {
        "range"
    }
}

/// Round-robin assignor: all partitions, sorted by topic then index, are
/// dealt to members in turn, skipping members not subscribed to the topic.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinAssignor;

impl PartitionAssignor for RoundRobinAssignor {
    fn assign(
        &self,
        subscriptions: &Subscriptions,
        partition_counts: &BTreeMap<String, u32>,
    ) -> MemberAssignments {
        let mut assignments = empty_assignments(subscriptions);
        let members: Vec<MemberId> = subscriptions.keys().copied().collect();
        if members.is_empty() {
            return assignments;
        }

        let mut cursor = 0usize;
        for (topic, &count) in partition_counts {
            for partition in 0..u64::from(count) {
                // Bounded scan: at most one full pass over the members.
                for _ in 0..members.len() {
                    let member = members[cursor % members.len()];
                    cursor += 1;
                    if subscriptions
                        .get(&member)
                        .is_some_and(|topics| topics.contains(topic))
                    {
                        assignments
                            .entry(member)
                            .or_default()
                            .push(TopicPartition::new(topic.clone(), PartitionId::new(partition)));
                        break;
                    }
                }
            }
        }

        assignments
    }

    fn name(&self) -> &'static str {
        "roundrobin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriptions(members: &[(u64, &[&str])]) -> Subscriptions {
        members
            .iter()
            .map(|(id, topics)| {
                (
                    MemberId::new(*id),
                    topics.iter().map(|t| (*t).to_string()).collect(),
                )
            })
            .collect()
    }

    fn counts(topics: &[(&str, u32)]) -> BTreeMap<String, u32> {
        topics.iter().map(|(t, c)| ((*t).to_string(), *c)).collect()
    }

    fn owned(assignments: &MemberAssignments, member: u64) -> Vec<u64> {
        assignments[&MemberId::new(member)]
            .iter()
            .map(|tp| tp.partition.get())
            .collect()
    }

    #[test]
    fn test_range_uneven_split() {
        let subs = subscriptions(&[(1, &["t"]), (2, &["t"])]);
        let assignments = RangeAssignor.assign(&subs, &counts(&[("t", 5)]));

        assert_eq!(owned(&assignments, 1), vec![0, 1, 2]);
        assert_eq!(owned(&assignments, 2), vec![3, 4]);
    }

    #[test]
    fn test_range_more_members_than_partitions() {
        let subs = subscriptions(&[(1, &["t"]), (2, &["t"]), (3, &["t"])]);
        let assignments = RangeAssignor.assign(&subs, &counts(&[("t", 2)]));

        assert_eq!(owned(&assignments, 1), vec![0]);
        assert_eq!(owned(&assignments, 2), vec![1]);
        assert!(owned(&assignments, 3).is_empty());
    }

    #[test]
    fn test_range_respects_subscriptions() {
        let subs = subscriptions(&[(1, &["a"]), (2, &["a", "b"])]);
        let assignments = RangeAssignor.assign(&subs, &counts(&[("a", 2), ("b", 2)]));

        let member1 = &assignments[&MemberId::new(1)];
        assert!(member1.iter().all(|tp| tp.topic == "a"));
        let member2_b = assignments[&MemberId::new(2)]
            .iter()
            .filter(|tp| tp.topic == "b")
            .count();
        assert_eq!(member2_b, 2);
    }

    #[test]
    fn test_round_robin_deals_in_turn() {
        let subs = subscriptions(&[(1, &["t"]), (2, &["t"])]);
        let assignments = RoundRobinAssignor.assign(&subs, &counts(&[("t", 4)]));

        assert_eq!(owned(&assignments, 1), vec![0, 2]);
        assert_eq!(owned(&assignments, 2), vec![1, 3]);
    }

    #[test]
    fn test_every_partition_assigned_once() {
        let subs = subscriptions(&[(1, &["a", "b"]), (2, &["b"]), (3, &["a"])]);
        let topic_counts = counts(&[("a", 7), ("b", 3)]);

        for strategy in [AssignmentStrategy::Range, AssignmentStrategy::RoundRobin] {
            let assignments = strategy.assignor().assign(&subs, &topic_counts);
            let mut all: Vec<TopicPartition> =
                assignments.values().flatten().cloned().collect();
            let total = all.len();
            all.sort();
            all.dedup();
            assert_eq!(total, all.len(), "{strategy:?} assigned a partition twice");
            assert_eq!(total, 10, "{strategy:?} left a partition unassigned");
        }
    }

    #[test]
    fn test_no_members() {
        let assignments = RangeAssignor.assign(&Subscriptions::new(), &counts(&[("t", 3)]));
        assert!(assignments.is_empty());
    }
}
