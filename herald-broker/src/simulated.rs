//! In-memory simulated broker.
//!
//! `SimulatedBroker` implements [`Broker`] over in-memory partition logs and
//! a [`GroupCoordinator`]. Clones share state, so a producer, several
//! consumers and the test itself can all hold a handle to the same broker.
//!
//! Faults are injected deterministically: probabilistic failures are derived
//! from the seed and an operation counter, and one-shot forced failures can
//! be armed through [`SimulatedBroker::fault_config`]. Time is measured with
//! `tokio::time`, so paused-clock tests control session expiry.

#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use herald_core::{
    BrokerErrorKind, ConsumedRecord, GenerationId, Limits, MemberId, Offset, PartitionId, Record,
    Timestamp, TopicPartition,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::assignor::AssignmentStrategy;
use crate::broker::{
    Acks, Broker, FetchResponse, HeartbeatOutcome, JoinGroupRequest, JoinOutcome, LogBounds,
};
use crate::error::{BrokerError, BrokerResult};
use crate::group::{GroupCoordinator, GroupSnapshot};
use crate::log::PartitionLog;

// -----------------------------------------------------------------------------
// Fault Configuration
// -----------------------------------------------------------------------------

/// Fault configuration for the simulated broker.
#[derive(Debug, Clone, Default)]
pub struct BrokerFaultConfig {
    /// Every request fails with `Unreachable` while set.
    pub unreachable: bool,
    /// Probability of an append failing (0.0 - 1.0).
    pub append_fail_rate: f64,
    /// Probability of a fetch failing (0.0 - 1.0).
    pub fetch_fail_rate: f64,
    /// Probability of an offset commit failing (0.0 - 1.0).
    pub commit_fail_rate: f64,
    /// Number of upcoming appends forced to fail.
    pub force_append_failures: u32,
    /// Number of upcoming fetches forced to fail.
    pub force_fetch_failures: u32,
    /// Number of upcoming commits forced to fail.
    pub force_commit_failures: u32,
}

impl BrokerFaultConfig {
    /// No faults (all operations succeed).
    #[must_use]
    pub const fn none() -> Self {
        Self {
            unreachable: false,
            append_fail_rate: 0.0,
            fetch_fail_rate: 0.0,
            commit_fail_rate: 0.0,
            force_append_failures: 0,
            force_fetch_failures: 0,
            force_commit_failures: 0,
        }
    }

    /// Flaky configuration for stress testing.
    #[must_use]
    pub const fn flaky() -> Self {
        Self {
            append_fail_rate: 0.05,
            fetch_fail_rate: 0.05,
            commit_fail_rate: 0.05,
            ..Self::none()
        }
    }

    /// Builder: set append fail rate.
    #[must_use]
    pub const fn with_append_fail_rate(mut self, rate: f64) -> Self {
        self.append_fail_rate = rate;
        self
    }

    /// Builder: set fetch fail rate.
    #[must_use]
    pub const fn with_fetch_fail_rate(mut self, rate: f64) -> Self {
        self.fetch_fail_rate = rate;
        self
    }

    /// Builder: set commit fail rate.
    #[must_use]
    pub const fn with_commit_fail_rate(mut self, rate: f64) -> Self {
        self.commit_fail_rate = rate;
        self
    }
}

/// Which fault knobs apply to a request.
#[derive(Debug, Clone, Copy)]
enum FaultTarget {
    Append,
    Fetch,
    Commit,
    Metadata,
}

// -----------------------------------------------------------------------------
// Simulated Broker
// -----------------------------------------------------------------------------

/// Settings for a simulated broker.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedBrokerConfig {
    /// How group partitions are assigned.
    pub assignment_strategy: AssignmentStrategy,
    /// Maximum members per consumer group.
    pub max_members_per_group: u32,
    /// Maximum size of a single record in bytes.
    pub max_message_bytes: usize,
    /// Partition count for topics created on first use; `None` disables
    /// auto-creation.
    pub auto_create_partitions: Option<u32>,
}

impl Default for SimulatedBrokerConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            assignment_strategy: AssignmentStrategy::Range,
            max_members_per_group: limits.max_members_per_group,
            max_message_bytes: limits.max_record_bytes as usize,
            auto_create_partitions: Some(1),
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    topics: HashMap<String, Vec<PartitionLog>>,
    groups: GroupCoordinator,
    config: SimulatedBrokerConfig,
}

impl BrokerState {
    fn ensure_topic(&mut self, topic: &str) -> BrokerResult<u32> {
        if let Some(logs) = self.topics.get(topic) {
            #[allow(clippy::cast_possible_truncation)]
            return Ok(logs.len() as u32);
        }
        let Some(partitions) = self.config.auto_create_partitions else {
            return Err(BrokerError::UnknownTopic {
                topic: topic.to_string(),
            });
        };
        self.create_topic(topic, partitions);
        debug!(topic = %topic, partitions, "Auto-created topic");
        Ok(partitions)
    }

    fn create_topic(&mut self, topic: &str, partitions: u32) {
        let logs = (0..u64::from(partitions))
            .map(|idx| PartitionLog::new(TopicPartition::new(topic, PartitionId::new(idx))))
            .collect();
        self.topics.insert(topic.to_string(), logs);
    }

    fn log(&self, partition: &TopicPartition) -> BrokerResult<&PartitionLog> {
        let logs = self
            .topics
            .get(&partition.topic)
            .ok_or_else(|| BrokerError::UnknownTopic {
                topic: partition.topic.clone(),
            })?;
        usize::try_from(partition.partition.get())
            .ok()
            .and_then(|idx| logs.get(idx))
            .ok_or_else(|| BrokerError::UnknownPartition {
                partition: partition.clone(),
            })
    }

    fn log_mut(&mut self, partition: &TopicPartition) -> BrokerResult<&mut PartitionLog> {
        self.ensure_topic(&partition.topic)?;
        let logs = self
            .topics
            .get_mut(&partition.topic)
            .ok_or_else(|| BrokerError::UnknownTopic {
                topic: partition.topic.clone(),
            })?;
        usize::try_from(partition.partition.get())
            .ok()
            .and_then(|idx| logs.get_mut(idx))
            .ok_or_else(|| BrokerError::UnknownPartition {
                partition: partition.clone(),
            })
    }
}

/// In-memory broker for tests and the demo.
///
/// Clones share state via `Arc`.
#[derive(Debug, Clone)]
pub struct SimulatedBroker {
    state: Arc<Mutex<BrokerState>>,
    fault_config: Arc<Mutex<BrokerFaultConfig>>,
    /// RNG seed for deterministic faults.
    seed: u64,
    /// Operation counter for deterministic RNG.
    counter: Arc<AtomicU64>,
    started: Instant,
}

impl SimulatedBroker {
    /// Creates a broker with default settings and no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, SimulatedBrokerConfig::default())
    }

    /// Creates a broker with the given settings and no faults.
    #[must_use]
    pub fn with_config(seed: u64, config: SimulatedBrokerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                topics: HashMap::new(),
                groups: GroupCoordinator::new(
                    config.assignment_strategy,
                    config.max_members_per_group,
                ),
                config,
            })),
            fault_config: Arc::new(Mutex::new(BrokerFaultConfig::none())),
            seed,
            counter: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
        }
    }

    /// Creates a broker with default settings and fault injection.
    #[must_use]
    pub fn with_faults(seed: u64, faults: BrokerFaultConfig) -> Self {
        let broker = Self::new(seed);
        *broker.fault_config() = faults;
        broker
    }

    /// Returns fault config for modification.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn fault_config(&self) -> MutexGuard<'_, BrokerFaultConfig> {
        self.fault_config.lock().expect("fault config lock poisoned")
    }

    /// Makes every request fail (or succeed again) as if the network were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.fault_config().unreachable = unreachable;
        warn!(unreachable, "Simulated broker reachability changed");
    }

    /// Creates a topic. Creating an existing topic is a no-op.
    ///
    /// # Errors
    /// Returns `InvalidRequest` if `partitions` is zero or the name is empty.
    pub fn create_topic(&self, topic: &str, partitions: u32) -> BrokerResult<()> {
        if topic.is_empty() {
            return Err(BrokerError::InvalidRequest {
                reason: "topic name must not be empty",
            });
        }
        if partitions == 0 {
            return Err(BrokerError::InvalidRequest {
                reason: "topic must have at least one partition",
            });
        }

        let mut state = self.state();
        if !state.topics.contains_key(topic) {
            state.create_topic(topic, partitions);
            debug!(topic = %topic, partitions, "Created topic");
        }
        Ok(())
    }

    /// Drops records before `offset`, simulating retention.
    ///
    /// # Errors
    /// Returns an error if the partition does not exist.
    pub fn delete_records_before(
        &self,
        partition: &TopicPartition,
        offset: Offset,
    ) -> BrokerResult<usize> {
        let mut state = self.state();
        let log = state.log_mut(partition)?;
        Ok(log.delete_records_before(offset))
    }

    /// Returns every retained record of a partition (bypasses faults).
    #[must_use]
    pub fn records(&self, partition: &TopicPartition) -> Vec<ConsumedRecord> {
        let state = self.state();
        state.log(partition).map_or_else(
            |_| Vec::new(),
            |log| {
                log.read(log.log_start_offset(), u32::MAX)
                    .unwrap_or_default()
            },
        )
    }

    /// Returns a partition's log end offset (bypasses faults).
    #[must_use]
    pub fn log_end_offset(&self, partition: &TopicPartition) -> Option<Offset> {
        self.state().log(partition).ok().map(PartitionLog::log_end_offset)
    }

    /// Returns a group's committed offset (bypasses faults).
    #[must_use]
    pub fn committed(&self, group_id: &str, partition: &TopicPartition) -> Option<Offset> {
        self.state().groups.committed(group_id, partition)
    }

    /// Returns a snapshot of a group (bypasses faults).
    #[must_use]
    pub fn group_snapshot(&self, group_id: &str) -> Option<GroupSnapshot> {
        self.state().groups.snapshot(group_id)
    }

    /// Evicts members of a group whose session expired.
    pub fn expire_sessions(&self, group_id: &str) -> usize {
        let now = self.now_us();
        self.state().groups.expire(group_id, now)
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().expect("broker state lock poisoned")
    }

    #[allow(clippy::cast_possible_truncation)] // u64 micros cover 500k years.
    fn now_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    /// Deterministic RNG: `(seed + counter) * M`.
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = self
            .seed
            .wrapping_add(counter)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15);
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }

    fn check_faults(&self, operation: &'static str, target: FaultTarget) -> BrokerResult<()> {
        let rate = {
            let mut guard = self.fault_config();
            let config = &mut *guard;
            if config.unreachable {
                return Err(BrokerError::unreachable(operation));
            }

            let knobs = match target {
                FaultTarget::Append => {
                    Some((&mut config.force_append_failures, config.append_fail_rate))
                }
                FaultTarget::Fetch => {
                    Some((&mut config.force_fetch_failures, config.fetch_fail_rate))
                }
                FaultTarget::Commit => {
                    Some((&mut config.force_commit_failures, config.commit_fail_rate))
                }
                FaultTarget::Metadata => None,
            };
            let Some((forced, rate)) = knobs else {
                return Ok(());
            };
            if *forced > 0 {
                *forced -= 1;
                debug!(operation, "Injecting forced failure");
                return Err(BrokerError::Transport {
                    kind: BrokerErrorKind::ConnectionReset,
                    operation,
                });
            }
            rate
        };

        if self.should_inject_fault(rate) {
            debug!(operation, "Injecting random failure");
            return Err(BrokerError::Transport {
                kind: BrokerErrorKind::ConnectionReset,
                operation,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for SimulatedBroker {
    async fn partition_count(&self, topic: &str) -> BrokerResult<u32> {
        self.check_faults("partition_count", FaultTarget::Metadata)?;
        self.state().ensure_topic(topic)
    }

    async fn append(
        &self,
        partition: &TopicPartition,
        records: Vec<Record>,
        acks: Acks,
    ) -> BrokerResult<Offset> {
        self.check_faults("append", FaultTarget::Append)?;

        let mut state = self.state();
        let max = state.config.max_message_bytes;
        if let Some(size) = records.iter().map(Record::size).find(|&size| size > max) {
            return Err(BrokerError::RecordTooLarge { size, max });
        }

        let count = records.len();
        let log = state.log_mut(partition)?;
        let base = log.append(records, Timestamp::now());
        debug!(partition = %partition, base = %base, count, acks = ?acks, "Appended records");
        Ok(base)
    }

    async fn fetch(
        &self,
        partition: &TopicPartition,
        from: Offset,
        max_records: u32,
    ) -> BrokerResult<FetchResponse> {
        self.check_faults("fetch", FaultTarget::Fetch)?;

        let state = self.state();
        let log = state.log(partition)?;
        Ok(FetchResponse {
            records: log.read(from, max_records)?,
            log_start_offset: log.log_start_offset(),
            log_end_offset: log.log_end_offset(),
        })
    }

    async fn log_bounds(&self, partition: &TopicPartition) -> BrokerResult<LogBounds> {
        self.check_faults("log_bounds", FaultTarget::Metadata)?;

        let state = self.state();
        let log = state.log(partition)?;
        Ok(LogBounds {
            start: log.log_start_offset(),
            end: log.log_end_offset(),
        })
    }

    async fn join_group(&self, request: JoinGroupRequest) -> BrokerResult<JoinOutcome> {
        self.check_faults("join_group", FaultTarget::Metadata)?;

        let now = self.now_us();
        let mut state = self.state();
        let mut counts = BTreeMap::new();
        for topic in &request.topics {
            // Subscribing to a missing topic is allowed; it just has no
            // partitions to hand out.
            if let Ok(count) = state.ensure_topic(topic) {
                counts.insert(topic.clone(), count);
            }
        }
        state.groups.join(&request, &counts, now)
    }

    async fn heartbeat(
        &self,
        group_id: &str,
        member_id: MemberId,
        generation: GenerationId,
    ) -> BrokerResult<HeartbeatOutcome> {
        self.check_faults("heartbeat", FaultTarget::Metadata)?;
        let now = self.now_us();
        self.state()
            .groups
            .heartbeat(group_id, member_id, generation, now)
    }

    async fn leave_group(&self, group_id: &str, member_id: MemberId) -> BrokerResult<()> {
        self.check_faults("leave_group", FaultTarget::Metadata)?;
        let now = self.now_us();
        self.state().groups.leave(group_id, member_id, now);
        Ok(())
    }

    async fn commit_offsets(
        &self,
        group_id: &str,
        member_id: MemberId,
        generation: GenerationId,
        offsets: &[(TopicPartition, Offset)],
    ) -> BrokerResult<()> {
        self.check_faults("commit_offsets", FaultTarget::Commit)?;
        let now = self.now_us();
        self.state()
            .groups
            .commit(group_id, member_id, generation, offsets, now)
    }

    async fn committed_offset(
        &self,
        group_id: &str,
        partition: &TopicPartition,
    ) -> BrokerResult<Option<Offset>> {
        self.check_faults("committed_offset", FaultTarget::Metadata)?;
        Ok(self.state().groups.committed(group_id, partition))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn tp(topic: &str, partition: u64) -> TopicPartition {
        TopicPartition::new(topic, PartitionId::new(partition))
    }

    #[tokio::test]
    async fn test_append_and_fetch() {
        let broker = SimulatedBroker::new(42);
        broker.create_topic("t", 2).unwrap();

        let base = broker
            .append(&tp("t", 1), vec![Record::new("t", "a"), Record::new("t", "b")], Acks::Leader)
            .await
            .unwrap();
        assert_eq!(base, Offset::new(0));

        let response = broker.fetch(&tp("t", 1), Offset::new(0), 10).await.unwrap();
        assert_eq!(response.records.len(), 2);
        assert_eq!(response.records[1].value, bytes::Bytes::from("b"));
        assert_eq!(response.records[1].partition, PartitionId::new(1));
        assert_eq!(response.log_end_offset, Offset::new(2));
    }

    #[tokio::test]
    async fn test_unknown_partition() {
        let broker = SimulatedBroker::new(42);
        broker.create_topic("t", 1).unwrap();

        let err = broker
            .append(&tp("t", 5), vec![Record::new("t", "a")], Acks::Leader)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownPartition { .. }));
    }

    #[tokio::test]
    async fn test_auto_create_disabled() {
        let broker = SimulatedBroker::with_config(
            42,
            SimulatedBrokerConfig {
                auto_create_partitions: None,
                ..SimulatedBrokerConfig::default()
            },
        );
        let err = broker.partition_count("missing").await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTopic { .. }));
    }

    #[tokio::test]
    async fn test_record_too_large() {
        let broker = SimulatedBroker::with_config(
            42,
            SimulatedBrokerConfig {
                max_message_bytes: 16,
                ..SimulatedBrokerConfig::default()
            },
        );
        let err = broker
            .append(&tp("t", 0), vec![Record::new("t", vec![0u8; 64])], Acks::Leader)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::RecordTooLarge { max: 16, .. }));
    }

    #[tokio::test]
    async fn test_forced_failure() {
        let broker = SimulatedBroker::new(42);
        broker.create_topic("t", 1).unwrap();

        broker.fault_config().force_append_failures = 1;
        let err = broker
            .append(&tp("t", 0), vec![Record::new("t", "a")], Acks::Leader)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // One-shot.
        broker
            .append(&tp("t", 0), vec![Record::new("t", "a")], Acks::Leader)
            .await
            .unwrap();
        assert_eq!(broker.log_end_offset(&tp("t", 0)), Some(Offset::new(1)));
    }

    #[tokio::test]
    async fn test_probabilistic_failure() {
        let broker =
            SimulatedBroker::with_faults(42, BrokerFaultConfig::none().with_fetch_fail_rate(1.0));
        broker.create_topic("t", 1).unwrap();

        for _ in 0..10 {
            assert!(broker.fetch(&tp("t", 0), Offset::new(0), 10).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_unreachable() {
        let broker = SimulatedBroker::new(42);
        broker.set_unreachable(true);
        let err = broker.partition_count("t").await.unwrap_err();
        assert_eq!(err, BrokerError::unreachable("partition_count"));

        broker.set_unreachable(false);
        assert_eq!(broker.partition_count("t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let broker1 = SimulatedBroker::new(42);
        let broker2 = broker1.clone();
        broker1.create_topic("t", 3).unwrap();
        assert_eq!(broker2.partition_count("t").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_group_round_trip() {
        let broker = SimulatedBroker::new(42);
        broker.create_topic("t", 2).unwrap();

        let outcome = broker
            .join_group(JoinGroupRequest {
                group_id: "g".to_string(),
                member_id: None,
                topics: BTreeSet::from(["t".to_string()]),
                session_timeout_us: 10_000_000,
            })
            .await
            .unwrap();
        let JoinOutcome::Complete(assignment) = outcome else {
            panic!("single member should complete immediately");
        };
        assert_eq!(assignment.partitions.len(), 2);

        broker
            .commit_offsets("g", assignment.member_id, assignment.generation, &[(tp("t", 0), Offset::new(5))])
            .await
            .unwrap();
        assert_eq!(
            broker.committed_offset("g", &tp("t", 0)).await.unwrap(),
            Some(Offset::new(5))
        );
        assert_eq!(broker.committed("g", &tp("t", 1)), None);
    }

    #[tokio::test]
    async fn test_retention_moves_log_start() {
        let broker = SimulatedBroker::new(42);
        broker.create_topic("t", 1).unwrap();
        broker
            .append(&tp("t", 0), (0..5).map(|i| Record::new("t", format!("{i}"))).collect(), Acks::Leader)
            .await
            .unwrap();

        assert_eq!(broker.delete_records_before(&tp("t", 0), Offset::new(3)).unwrap(), 3);
        let bounds = broker.log_bounds(&tp("t", 0)).await.unwrap();
        assert_eq!(bounds.start, Offset::new(3));
        assert!(matches!(
            broker.fetch(&tp("t", 0), Offset::new(0), 10).await,
            Err(BrokerError::OffsetOutOfRange { .. })
        ));
        assert_eq!(broker.records(&tp("t", 0)).len(), 2);
    }
}
