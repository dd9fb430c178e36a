//! Property definitions and checkers for Herald tests.
//!
//! Each checker inspects what a test observed (assignments, deliveries,
//! commits) and returns every violation it finds, so a failing test can
//! print all of them at once.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use herald_broker::MemberAssignments;
use herald_core::{MemberId, Offset, TopicPartition};

use crate::scenarios::Delivery;

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a delivery or assignment property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// A partition is owned by more than one member in a generation.
    SharedPartition {
        /// The partition.
        partition: TopicPartition,
        /// Members that own it.
        members: Vec<MemberId>,
    },
    /// A subscribed partition is owned by no member.
    UnassignedPartition {
        /// The partition.
        partition: TopicPartition,
    },
    /// A member owns a partition nobody subscribed to.
    UnexpectedPartition {
        /// The partition.
        partition: TopicPartition,
        /// The member that owns it.
        member: MemberId,
    },
    /// A handler saw a lower offset after a higher one.
    OutOfOrder {
        /// The partition.
        partition: TopicPartition,
        /// Offset delivered before.
        previous: Offset,
        /// Offset delivered after it.
        offset: Offset,
    },
    /// An acknowledged record never reached a handler.
    Lost {
        /// The partition.
        partition: TopicPartition,
        /// Offset of the lost record.
        offset: Offset,
    },
    /// A record reached handlers more than once where that is not allowed.
    Duplicated {
        /// The partition.
        partition: TopicPartition,
        /// Offset of the duplicated record.
        offset: Offset,
        /// Number of deliveries.
        count: usize,
    },
    /// The committed offset skips a record whose handler never completed.
    CommitPastUnhandled {
        /// The partition.
        partition: TopicPartition,
        /// Committed offset.
        committed: Offset,
        /// First offset without a completed handler.
        first_unhandled: Offset,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedPartition { partition, members } => {
                write!(f, "Partition {partition} owned by several members: {members:?}")
            }
            Self::UnassignedPartition { partition } => {
                write!(f, "Partition {partition} is not assigned")
            }
            Self::UnexpectedPartition { partition, member } => {
                write!(f, "Member {member} owns unsubscribed partition {partition}")
            }
            Self::OutOfOrder {
                partition,
                previous,
                offset,
            } => {
                write!(
                    f,
                    "Partition {partition} delivered offset {offset} after {previous}"
                )
            }
            Self::Lost { partition, offset } => {
                write!(f, "Record {partition}@{offset} was never delivered")
            }
            Self::Duplicated {
                partition,
                offset,
                count,
            } => {
                write!(f, "Record {partition}@{offset} delivered {count} times")
            }
            Self::CommitPastUnhandled {
                partition,
                committed,
                first_unhandled,
            } => {
                write!(
                    f,
                    "Partition {partition} committed {committed} past unhandled offset \
                     {first_unhandled}"
                )
            }
        }
    }
}

// ============================================================================
// Checkers
// ============================================================================

/// Checks that `assignments` split `expected` into disjoint, complete parts.
#[must_use]
pub fn check_assignment(
    expected: &BTreeSet<TopicPartition>,
    assignments: &MemberAssignments,
) -> Vec<PropertyViolation> {
    let mut owners: BTreeMap<&TopicPartition, Vec<MemberId>> = BTreeMap::new();
    let mut violations = Vec::new();

    for (member, partitions) in assignments {
        for partition in partitions {
            if !expected.contains(partition) {
                violations.push(PropertyViolation::UnexpectedPartition {
                    partition: partition.clone(),
                    member: *member,
                });
            }
            owners.entry(partition).or_default().push(*member);
        }
    }

    for (partition, members) in &owners {
        if members.len() > 1 {
            violations.push(PropertyViolation::SharedPartition {
                partition: (*partition).clone(),
                members: members.clone(),
            });
        }
    }
    for partition in expected {
        if !owners.contains_key(partition) {
            violations.push(PropertyViolation::UnassignedPartition {
                partition: partition.clone(),
            });
        }
    }

    violations
}

/// Checks that each consumer saw every partition in non-decreasing offset
/// order.
///
/// Redelivery of the same offset is allowed; going back to a lower one is
/// not.
#[must_use]
pub fn check_ordering(deliveries: &[Delivery]) -> Vec<PropertyViolation> {
    let mut last: HashMap<(usize, &TopicPartition), Offset> = HashMap::new();
    let mut violations = Vec::new();

    for delivery in deliveries {
        let key = (delivery.consumer, &delivery.partition);
        if let Some(&previous) = last.get(&key) {
            if delivery.offset < previous {
                violations.push(PropertyViolation::OutOfOrder {
                    partition: delivery.partition.clone(),
                    previous,
                    offset: delivery.offset,
                });
            }
        }
        last.insert(key, delivery.offset);
    }

    violations
}

/// Checks that every acknowledged record reached a handler at least once.
#[must_use]
pub fn check_at_least_once(
    acknowledged: &[(TopicPartition, Offset)],
    deliveries: &[Delivery],
) -> Vec<PropertyViolation> {
    let delivered: BTreeSet<(&TopicPartition, Offset)> = deliveries
        .iter()
        .map(|d| (&d.partition, d.offset))
        .collect();

    acknowledged
        .iter()
        .filter(|(partition, offset)| !delivered.contains(&(partition, *offset)))
        .map(|(partition, offset)| PropertyViolation::Lost {
            partition: partition.clone(),
            offset: *offset,
        })
        .collect()
}

/// Checks that no record reached handlers more than once.
#[must_use]
pub fn check_no_duplicates(deliveries: &[Delivery]) -> Vec<PropertyViolation> {
    let mut counts: BTreeMap<(&TopicPartition, Offset), usize> = BTreeMap::new();
    for delivery in deliveries {
        *counts.entry((&delivery.partition, delivery.offset)).or_default() += 1;
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|((partition, offset), count)| PropertyViolation::Duplicated {
            partition: partition.clone(),
            offset,
            count,
        })
        .collect()
}

/// Checks that a committed offset does not pass the first record whose
/// handler never completed.
#[must_use]
pub fn check_commit_bound(
    partition: &TopicPartition,
    committed: Option<Offset>,
    first_unhandled: Offset,
) -> Option<PropertyViolation> {
    committed
        .filter(|&committed| committed > first_unhandled)
        .map(|committed| PropertyViolation::CommitPastUnhandled {
            partition: partition.clone(),
            committed,
            first_unhandled,
        })
}
