//! In-memory partition log.
//!
//! Offsets are assigned densely from zero. Retention is simulated by
//! dropping a prefix of the log, which moves the log start offset.

use herald_core::{ConsumedRecord, Offset, PartitionId, Record, Timestamp, TopicPartition};

use crate::error::{BrokerError, BrokerResult};

/// A single partition's ordered record log.
#[derive(Debug, Clone)]
pub struct PartitionLog {
    partition: TopicPartition,
    log_start: Offset,
    records: Vec<ConsumedRecord>,
}

impl PartitionLog {
    /// Creates an empty log.
    #[must_use]
    pub const fn new(partition: TopicPartition) -> Self {
        Self {
            partition,
            log_start: Offset::new(0),
            records: Vec::new(),
        }
    }

    /// Returns the first retained offset.
    #[must_use]
    pub const fn log_start_offset(&self) -> Offset {
        self.log_start
    }

    /// Returns the offset the next appended record will get.
    #[must_use]
    pub fn log_end_offset(&self) -> Offset {
        self.log_start.advance(self.records.len() as u64)
    }

    /// Appends records, returning the offset of the first one.
    ///
    /// An empty append returns the current log end offset.
    pub fn append(&mut self, records: Vec<Record>, append_time: Timestamp) -> Offset {
        let base = self.log_end_offset();
        let partition_id: PartitionId = self.partition.partition;

        let mut offset = base;
        for record in records {
            self.records
                .push(ConsumedRecord::from_record(record, partition_id, offset, append_time));
            offset = offset.next();
        }

        debug_assert_eq!(self.log_end_offset(), offset);
        base
    }

    /// Reads up to `max_records` starting at `from`.
    ///
    /// Reading at the log end returns no records.
    ///
    /// # Errors
    /// Returns `OffsetOutOfRange` if `from` is before the log start or past
    /// the log end.
    pub fn read(&self, from: Offset, max_records: u32) -> BrokerResult<Vec<ConsumedRecord>> {
        let log_end = self.log_end_offset();
        if from < self.log_start || from > log_end {
            return Err(BrokerError::OffsetOutOfRange {
                partition: self.partition.clone(),
                offset: from,
                log_start: self.log_start,
                log_end,
            });
        }

        #[allow(clippy::cast_possible_truncation)] // Bounded by records.len().
        let start = (from.get() - self.log_start.get()) as usize;
        let end = start
            .saturating_add(max_records as usize)
            .min(self.records.len());
        let records = self.records[start..end].to_vec();

        debug_assert!(records.len() <= max_records as usize);
        Ok(records)
    }

    /// Drops every record before `offset`, as retention would.
    ///
    /// Returns the number of records removed.
    pub fn delete_records_before(&mut self, offset: Offset) -> usize {
        let target = offset.min(self.log_end_offset());
        if target <= self.log_start {
            return 0;
        }

        #[allow(clippy::cast_possible_truncation)]
        let count = (target.get() - self.log_start.get()) as usize;
        self.records.drain(..count);
        self.log_start = target;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_log() -> PartitionLog {
        PartitionLog::new(TopicPartition::new("t", PartitionId::new(0)))
    }

    fn make_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| Record::new("t", format!("record-{i}")))
            .collect()
    }

    #[test]
    fn test_append_assigns_dense_offsets() {
        let mut log = make_log();
        assert_eq!(log.append(make_records(3), Timestamp::from_millis(1)), Offset::new(0));
        assert_eq!(log.append(make_records(2), Timestamp::from_millis(2)), Offset::new(3));
        assert_eq!(log.log_end_offset(), Offset::new(5));

        let records = log.read(Offset::new(0), 10).unwrap();
        let offsets: Vec<u64> = records.iter().map(|r| r.offset.get()).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_read_partial() {
        let mut log = make_log();
        log.append(make_records(10), Timestamp::from_millis(1));

        let records = log.read(Offset::new(4), 3).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].offset, Offset::new(4));
    }

    #[test]
    fn test_read_at_end_is_empty() {
        let mut log = make_log();
        log.append(make_records(2), Timestamp::from_millis(1));
        assert!(log.read(Offset::new(2), 10).unwrap().is_empty());
    }

    #[test]
    fn test_read_out_of_range() {
        let mut log = make_log();
        log.append(make_records(2), Timestamp::from_millis(1));
        assert!(matches!(
            log.read(Offset::new(3), 10),
            Err(BrokerError::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn test_delete_records_before() {
        let mut log = make_log();
        log.append(make_records(5), Timestamp::from_millis(1));

        assert_eq!(log.delete_records_before(Offset::new(3)), 3);
        assert_eq!(log.log_start_offset(), Offset::new(3));
        assert_eq!(log.log_end_offset(), Offset::new(5));
        assert!(log.read(Offset::new(1), 10).is_err());
        assert_eq!(log.read(Offset::new(3), 10).unwrap()[0].offset, Offset::new(3));

        // Deleting behind the start is a no-op.
        assert_eq!(log.delete_records_before(Offset::new(1)), 0);
    }
}
