//! Consumer-side offset bookkeeping.
//!
//! The `CommitCoordinator` tracks, per assigned partition:
//!
//! - the next fetch position,
//! - one past the highest offset delivered to the handler,
//! - the contiguous acknowledged watermark, with a bitmap for
//!   acknowledgments that arrive ahead of it,
//! - the last offset committed to the broker.
//!
//! All offsets use the "next record to consume" convention. A commit
//! candidate never exceeds the delivered position, and commits never move
//! backwards.

use std::collections::BTreeMap;

use herald_core::{Offset, TopicPartition};
use roaring::RoaringBitmap;

use crate::config::CommitMode;
use crate::error::CommitError;

/// Offsets tracked for one partition.
#[derive(Debug, Clone)]
pub struct PartitionOffsets {
    /// Next offset to fetch.
    pub position: Offset,
    /// One past the highest offset delivered to the handler.
    pub delivered: Offset,
    /// Every offset below this one was acknowledged.
    pub acknowledged: Offset,
    /// Acknowledged offsets above `acknowledged`; bit N is offset
    /// `acknowledged + N`.
    acked_ahead: RoaringBitmap,
    /// Last offset committed to the broker.
    pub committed: Option<Offset>,
    /// Position the partition was assigned at.
    start: Offset,
    /// Offset requested by an explicit commit, not yet sent.
    requested: Option<Offset>,
}

impl PartitionOffsets {
    fn new(start: Offset, committed: Option<Offset>) -> Self {
        Self {
            position: start,
            delivered: start,
            acknowledged: start,
            acked_ahead: RoaringBitmap::new(),
            committed,
            start,
            requested: None,
        }
    }

    /// Advances `acknowledged` over contiguous acknowledged offsets.
    fn advance_acknowledged(&mut self) {
        // Bounded: a bitmap index is a u32.
        let mut advance = 0u64;
        while advance <= u64::from(u32::MAX) {
            #[allow(clippy::cast_possible_truncation)]
            if !self.acked_ahead.contains(advance as u32) {
                break;
            }
            advance += 1;
        }
        if advance > 0 {
            self.shift_acknowledged(advance);
        }
        debug_assert!(!self.acked_ahead.contains(0));
    }

    /// Moves `acknowledged` forward by `count`, rebasing the bitmap.
    fn shift_acknowledged(&mut self, count: u64) {
        let mut shifted = RoaringBitmap::new();
        for bit in &self.acked_ahead {
            if let Some(new_bit) = u64::from(bit).checked_sub(count) {
                #[allow(clippy::cast_possible_truncation)]
                shifted.insert(new_bit as u32);
            }
        }
        self.acked_ahead = shifted;
        self.acknowledged = self.acknowledged.advance(count);
    }

    /// The offset a commit would carry under `mode`, if it moves anything.
    fn commit_candidate(&self, mode: CommitMode) -> Option<Offset> {
        let policy = match mode {
            CommitMode::AutoInterval(_) => self.delivered,
            CommitMode::ManualAfterSuccess => self.acknowledged.min(self.delivered),
        };
        let candidate = self.requested.map_or(policy, |requested| requested.max(policy));
        debug_assert!(candidate <= self.delivered);

        match self.committed {
            Some(committed) => (candidate > committed).then_some(candidate),
            // Nothing committed yet: only commit once something moved past
            // the starting position, or when explicitly asked to.
            None => (candidate > self.start || self.requested.is_some()).then_some(candidate),
        }
    }
}

/// Tracks fetch, delivery, acknowledgment and commit offsets for the
/// partitions a consumer owns.
#[derive(Debug, Default)]
pub struct CommitCoordinator {
    partitions: BTreeMap<TopicPartition, PartitionOffsets>,
}

impl CommitCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            partitions: BTreeMap::new(),
        }
    }

    /// Starts tracking a partition at `start`.
    ///
    /// `committed` is the group's committed offset as read from the broker.
    pub fn assign(&mut self, partition: TopicPartition, start: Offset, committed: Option<Offset>) {
        self.partitions
            .insert(partition, PartitionOffsets::new(start, committed));
    }

    /// Stops tracking a partition, returning its final state.
    pub fn revoke(&mut self, partition: &TopicPartition) -> Option<PartitionOffsets> {
        self.partitions.remove(partition)
    }

    /// Stops tracking every partition.
    pub fn revoke_all(&mut self) {
        self.partitions.clear();
    }

    /// Returns the tracked partitions, sorted.
    #[must_use]
    pub fn assigned(&self) -> Vec<TopicPartition> {
        self.partitions.keys().cloned().collect()
    }

    /// Returns true if the partition is tracked.
    #[must_use]
    pub fn is_assigned(&self, partition: &TopicPartition) -> bool {
        self.partitions.contains_key(partition)
    }

    /// Returns a partition's offsets.
    #[must_use]
    pub fn offsets(&self, partition: &TopicPartition) -> Option<&PartitionOffsets> {
        self.partitions.get(partition)
    }

    /// Returns a partition's next fetch position.
    #[must_use]
    pub fn position(&self, partition: &TopicPartition) -> Option<Offset> {
        self.partitions.get(partition).map(|p| p.position)
    }

    /// Records that everything before `next` has been fetched.
    pub fn record_fetched(&mut self, partition: &TopicPartition, next: Offset) {
        if let Some(p) = self.partitions.get_mut(partition) {
            p.position = p.position.max(next);
        }
    }

    /// Records that `offset` is about to be handed to the handler.
    pub fn record_delivered(&mut self, partition: &TopicPartition, offset: Offset) {
        if let Some(p) = self.partitions.get_mut(partition) {
            p.delivered = p.delivered.max(offset.next());
        }
    }

    /// Records that the handler finished with `offset`.
    ///
    /// Acknowledging an offset at or below the watermark is a no-op.
    pub fn acknowledge(&mut self, partition: &TopicPartition, offset: Offset) {
        let Some(p) = self.partitions.get_mut(partition) else {
            return;
        };
        if offset < p.acknowledged {
            return;
        }
        let Ok(index) = u32::try_from(offset.get() - p.acknowledged.get()) else {
            return;
        };
        p.acked_ahead.insert(index);
        p.advance_acknowledged();
    }

    /// Moves the fetch position back to `offset` so it is delivered again.
    ///
    /// Acknowledgments at or above `offset` are forgotten.
    pub fn rewind(&mut self, partition: &TopicPartition, offset: Offset) {
        let Some(p) = self.partitions.get_mut(partition) else {
            return;
        };
        let offset = offset.max(p.acknowledged);
        p.position = p.position.min(offset);

        let keep = offset.get() - p.acknowledged.get();
        #[allow(clippy::cast_possible_truncation)]
        p.acked_ahead
            .remove_range(keep.min(u64::from(u32::MAX)) as u32..);
    }

    /// Moves the fetch position to `offset` after an offset reset.
    ///
    /// Jumping forward over records that no longer exist also moves the
    /// acknowledged watermark, so manual commits are not stuck behind the
    /// gap.
    pub fn seek(&mut self, partition: &TopicPartition, offset: Offset) {
        let Some(p) = self.partitions.get_mut(partition) else {
            return;
        };
        p.position = offset;
        if offset > p.acknowledged {
            let gap = offset.get() - p.acknowledged.get();
            p.shift_acknowledged(gap);
        }
    }

    /// Requests an explicit commit of `offset`.
    ///
    /// # Errors
    /// Fails if the partition is not assigned, the offset is past the
    /// delivered position, or it is below the last commit.
    pub fn commit(&mut self, partition: &TopicPartition, offset: Offset) -> Result<(), CommitError> {
        let p = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| CommitError::NotAssigned {
                partition: partition.clone(),
            })?;

        if offset > p.delivered {
            return Err(CommitError::BeyondDelivered {
                partition: partition.clone(),
                offset,
                delivered: p.delivered,
            });
        }
        if let Some(committed) = p.committed {
            if offset < committed {
                return Err(CommitError::Regression {
                    partition: partition.clone(),
                    offset,
                    committed,
                });
            }
        }

        p.requested = Some(p.requested.map_or(offset, |r| r.max(offset)));
        Ok(())
    }

    /// Returns the last offset committed for a partition.
    #[must_use]
    pub fn last_committed(&self, partition: &TopicPartition) -> Option<Offset> {
        self.partitions.get(partition).and_then(|p| p.committed)
    }

    /// Returns the offsets to commit under `mode`, sorted by partition.
    ///
    /// Only partitions whose commit would move forward are included.
    #[must_use]
    pub fn pending_commits(&self, mode: CommitMode) -> Vec<(TopicPartition, Offset)> {
        self.partitions
            .iter()
            .filter_map(|(tp, p)| p.commit_candidate(mode).map(|offset| (tp.clone(), offset)))
            .collect()
    }

    /// Records that the broker accepted `offset` for a partition.
    pub fn mark_committed(&mut self, partition: &TopicPartition, offset: Offset) {
        if let Some(p) = self.partitions.get_mut(partition) {
            p.committed = Some(p.committed.map_or(offset, |c| c.max(offset)));
            if p.requested.is_some_and(|r| r <= offset) {
                p.requested = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use herald_core::PartitionId;

    use super::*;

    const AUTO: CommitMode = CommitMode::AutoInterval(Duration::from_secs(1));
    const MANUAL: CommitMode = CommitMode::ManualAfterSuccess;

    fn tp() -> TopicPartition {
        TopicPartition::new("t", PartitionId::new(0))
    }

    fn deliver(coordinator: &mut CommitCoordinator, offsets: std::ops::Range<u64>) {
        for offset in offsets {
            coordinator.record_delivered(&tp(), Offset::new(offset));
        }
    }

    #[test]
    fn test_nothing_to_commit_initially() {
        let mut coordinator = CommitCoordinator::new();
        coordinator.assign(tp(), Offset::new(0), None);
        assert!(coordinator.pending_commits(AUTO).is_empty());
        assert!(coordinator.pending_commits(MANUAL).is_empty());
    }

    #[test]
    fn test_auto_commits_delivered_position() {
        let mut coordinator = CommitCoordinator::new();
        coordinator.assign(tp(), Offset::new(0), None);
        coordinator.record_fetched(&tp(), Offset::new(10));
        deliver(&mut coordinator, 0..4);

        assert_eq!(coordinator.pending_commits(AUTO), vec![(tp(), Offset::new(4))]);
        // Nothing acknowledged yet.
        assert!(coordinator.pending_commits(MANUAL).is_empty());
    }

    #[test]
    fn test_manual_commits_contiguous_acknowledgments() {
        let mut coordinator = CommitCoordinator::new();
        coordinator.assign(tp(), Offset::new(0), None);
        deliver(&mut coordinator, 0..5);

        coordinator.acknowledge(&tp(), Offset::new(0));
        coordinator.acknowledge(&tp(), Offset::new(1));
        coordinator.acknowledge(&tp(), Offset::new(3));
        assert_eq!(coordinator.pending_commits(MANUAL), vec![(tp(), Offset::new(2))]);

        coordinator.acknowledge(&tp(), Offset::new(2));
        assert_eq!(coordinator.pending_commits(MANUAL), vec![(tp(), Offset::new(4))]);
    }

    #[test]
    fn test_mark_committed_never_regresses() {
        let mut coordinator = CommitCoordinator::new();
        coordinator.assign(tp(), Offset::new(0), None);
        deliver(&mut coordinator, 0..5);

        coordinator.mark_committed(&tp(), Offset::new(5));
        coordinator.mark_committed(&tp(), Offset::new(3));
        assert_eq!(coordinator.last_committed(&tp()), Some(Offset::new(5)));
        assert!(coordinator.pending_commits(AUTO).is_empty());
    }

    #[test]
    fn test_explicit_commit_validation() {
        let mut coordinator = CommitCoordinator::new();
        coordinator.assign(tp(), Offset::new(0), Some(Offset::new(0)));
        deliver(&mut coordinator, 0..3);

        assert!(matches!(
            coordinator.commit(&tp(), Offset::new(4)),
            Err(CommitError::BeyondDelivered { .. })
        ));

        coordinator.commit(&tp(), Offset::new(2)).unwrap();
        assert_eq!(coordinator.pending_commits(MANUAL), vec![(tp(), Offset::new(2))]);
        coordinator.mark_committed(&tp(), Offset::new(2));

        assert!(matches!(
            coordinator.commit(&tp(), Offset::new(1)),
            Err(CommitError::Regression { .. })
        ));

        let other = TopicPartition::new("t", PartitionId::new(9));
        assert!(matches!(
            coordinator.commit(&other, Offset::new(0)),
            Err(CommitError::NotAssigned { .. })
        ));
    }

    #[test]
    fn test_rewind_redelivers_failed_offset() {
        let mut coordinator = CommitCoordinator::new();
        coordinator.assign(tp(), Offset::new(0), None);
        coordinator.record_fetched(&tp(), Offset::new(10));
        deliver(&mut coordinator, 0..6);
        for offset in 0..5 {
            coordinator.acknowledge(&tp(), Offset::new(offset));
        }

        // Handler failed at 5.
        coordinator.rewind(&tp(), Offset::new(5));
        assert_eq!(coordinator.position(&tp()), Some(Offset::new(5)));
        assert_eq!(coordinator.pending_commits(MANUAL), vec![(tp(), Offset::new(5))]);
    }

    #[test]
    fn test_seek_forward_moves_watermark() {
        let mut coordinator = CommitCoordinator::new();
        coordinator.assign(tp(), Offset::new(0), None);
        coordinator.seek(&tp(), Offset::new(100));

        let offsets = coordinator.offsets(&tp()).unwrap();
        assert_eq!(offsets.position, Offset::new(100));
        assert_eq!(offsets.acknowledged, Offset::new(100));
        // Nothing delivered past the gap yet, so nothing to commit.
        assert!(coordinator.pending_commits(MANUAL).is_empty());

        deliver(&mut coordinator, 100..102);
        coordinator.acknowledge(&tp(), Offset::new(100));
        assert_eq!(coordinator.pending_commits(MANUAL), vec![(tp(), Offset::new(101))]);
    }

    #[test]
    fn test_revoke_forgets_partition() {
        let mut coordinator = CommitCoordinator::new();
        coordinator.assign(tp(), Offset::new(0), None);
        deliver(&mut coordinator, 0..2);
        assert!(coordinator.revoke(&tp()).is_some());

        // Late calls for a revoked partition are ignored.
        coordinator.acknowledge(&tp(), Offset::new(0));
        coordinator.record_delivered(&tp(), Offset::new(3));
        assert!(!coordinator.is_assigned(&tp()));
        assert!(coordinator.pending_commits(AUTO).is_empty());
    }
}
