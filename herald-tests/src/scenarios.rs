//! Reusable test scenarios for Herald.
//!
//! Helpers to seed topics, run consumers on background tasks and record
//! what their handlers saw.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use herald_broker::{MemberAssignments, SimulatedBroker};
use herald_client::{
    ClientResult, Consumer, ConsumerConfig, HandlerError, Message, MessageHandler, Producer,
    ProducerConfig, StringCodec,
};
use herald_core::{Offset, Record, TopicPartition};
use tokio::task::JoinHandle;
use tracing::debug;

/// Seeds for reproducible testing.
pub mod seeds {
    /// Standard seeds for fault-injection tests.
    pub const REGRESSION_SEEDS: &[u64] = &[42, 12345, 0xDEAD_BEEF, 999, 7777, 0x1337, 1, 0];
}

/// Default topic used by the scenarios.
pub const TOPIC: &str = "t";

/// Default consumer group used by the scenarios.
pub const GROUP: &str = "g";

/// One handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Index of the consumer that handled the record.
    pub consumer: usize,
    /// Partition of the record.
    pub partition: TopicPartition,
    /// Offset of the record.
    pub offset: Offset,
    /// Decoded value.
    pub value: String,
}

/// Shared log of successful handler invocations.
#[derive(Debug, Clone, Default)]
pub struct DeliveryLog {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl DeliveryLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handler that records every message for `consumer`.
    #[must_use]
    pub fn handler(&self, consumer: usize) -> impl MessageHandler<String> {
        self.failing_handler(consumer, |_| false)
    }

    /// Returns a handler that fails wherever `fail` says so and records
    /// every other message for `consumer`.
    #[must_use]
    pub fn failing_handler(
        &self,
        consumer: usize,
        fail: impl Fn(&Message<String>) -> bool + Send + Sync + 'static,
    ) -> impl MessageHandler<String> {
        let deliveries = Arc::clone(&self.deliveries);
        let fail = Arc::new(fail);
        move |message: Message<String>| {
            let deliveries = Arc::clone(&deliveries);
            let fail = Arc::clone(&fail);
            async move {
                if (*fail)(&message) {
                    return Err(HandlerError::new(format!(
                        "rejected {}@{}",
                        message.partition, message.offset
                    )));
                }
                deliveries
                    .lock()
                    .expect("delivery log poisoned")
                    .push(Delivery {
                        consumer,
                        partition: message.topic_partition(),
                        offset: message.offset,
                        value: message.value,
                    });
                Ok(())
            }
        }
    }

    /// Returns a copy of every delivery so far.
    ///
    /// # Panics
    /// Panics if the log lock is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Delivery> {
        self.deliveries.lock().expect("delivery log poisoned").clone()
    }

    /// Returns the number of deliveries so far.
    ///
    /// # Panics
    /// Panics if the log lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deliveries.lock().expect("delivery log poisoned").len()
    }

    /// Returns true if nothing was delivered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the distinct `(partition, offset)` pairs delivered so far.
    #[must_use]
    pub fn distinct(&self) -> usize {
        let mut seen: Vec<_> = self
            .snapshot()
            .into_iter()
            .map(|d| (d.partition, d.offset))
            .collect();
        seen.sort();
        seen.dedup();
        seen.len()
    }
}

/// Creates a broker with one topic of `partitions` partitions.
///
/// # Panics
/// Panics if the topic cannot be created.
#[must_use]
pub fn broker(seed: u64, partitions: u32) -> Arc<SimulatedBroker> {
    let broker = Arc::new(SimulatedBroker::new(seed));
    broker
        .create_topic(TOPIC, partitions)
        .expect("topic creation failed");
    broker
}

/// Produces `count` records with values `"m0"`, `"m1"`, ... and returns
/// the acknowledged positions.
///
/// # Errors
/// Returns the first delivery failure.
pub async fn produce(
    broker: &Arc<SimulatedBroker>,
    config: ProducerConfig,
    count: usize,
) -> ClientResult<Vec<(TopicPartition, Offset)>> {
    let producer = Producer::new(Arc::clone(broker), config)?;
    let handles: Vec<_> = (0..count)
        .map(|i| producer.send(Record::new(TOPIC, format!("m{i}"))))
        .collect();

    let mut acknowledged = Vec::with_capacity(count);
    for handle in handles {
        let report = handle.await?;
        if let Some(offset) = report.offset {
            acknowledged.push((TopicPartition::new(report.topic, report.partition), offset));
        }
    }
    producer.close().await?;
    debug!(count = acknowledged.len(), "Produced records");
    Ok(acknowledged)
}

/// A consumer running on a background task.
pub struct RunningConsumer {
    /// The consumer.
    pub consumer: Arc<Consumer<SimulatedBroker>>,
    task: JoinHandle<ClientResult<()>>,
}

impl RunningConsumer {
    /// Subscribes a consumer to [`TOPIC`] in `group` and starts it.
    ///
    /// # Panics
    /// Panics if the config or subscription is rejected.
    pub fn start(
        broker: &Arc<SimulatedBroker>,
        config: ConsumerConfig,
        group: &str,
        handler: impl MessageHandler<String>,
    ) -> Self {
        let consumer = Arc::new(
            Consumer::new(Arc::clone(broker), config).expect("consumer config rejected"),
        );
        consumer
            .subscribe([TOPIC], group, StringCodec, handler)
            .expect("subscription rejected");

        let task = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.run().await })
        };
        Self { consumer, task }
    }

    /// Closes the consumer and returns the result of its run loop.
    ///
    /// # Panics
    /// Panics if the run task panicked.
    pub async fn stop(self) -> ClientResult<()> {
        self.consumer.close().await;
        self.task.await.expect("consumer task panicked")
    }

    /// Kills the run task without closing: no final commit, no leave.
    pub fn crash(self) {
        self.task.abort();
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Returns the group's assignments once it is stable with `members` members.
#[must_use]
pub fn stable_assignments(
    broker: &SimulatedBroker,
    group: &str,
    members: usize,
) -> Option<MemberAssignments> {
    broker
        .group_snapshot(group)
        .filter(|snapshot| {
            snapshot.phase == herald_broker::GroupPhase::Stable
                && snapshot.members.len() == members
        })
        .map(|snapshot| snapshot.assignments)
}

/// Returns every partition of [`TOPIC`].
#[must_use]
pub fn all_partitions(partitions: u32) -> Vec<TopicPartition> {
    (0..u64::from(partitions))
        .map(|p| TopicPartition::new(TOPIC, herald_core::PartitionId::new(p)))
        .collect()
}
