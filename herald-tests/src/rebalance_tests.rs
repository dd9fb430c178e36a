//! Consumer group rebalance tests.
//!
//! Several consumers share one group:
//! - once stable, every partition has exactly one owner
//! - partitions move when a member leaves or its session expires
//! - nothing acknowledged is lost across the handover
//! - a handler still running when its session ends keeps the partition
//!   busy in the next one

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use herald_client::{
    CommitMode, Consumer, ConsumerConfig, ConsumerState, HandlerError, Message, ProducerConfig,
    StringCodec,
};
use herald_core::{Offset, PartitionId, TopicPartition};

use crate::properties::{check_assignment, check_at_least_once, check_ordering};
use crate::scenarios::{self, DeliveryLog, RunningConsumer, GROUP, TOPIC};

const WAIT: Duration = Duration::from_secs(10);

fn is_stable(consumer: &RunningConsumer) -> bool {
    matches!(consumer.consumer.state(), ConsumerState::Stable { .. })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rebalance_assignment_is_exclusive() {
    let broker = scenarios::broker(42, 6);
    let log = DeliveryLog::new();
    let consumers: Vec<_> = (0..3)
        .map(|i| RunningConsumer::start(&broker, ConsumerConfig::for_testing(), GROUP, log.handler(i)))
        .collect();

    assert!(
        scenarios::wait_for(WAIT, || scenarios::stable_assignments(&broker, GROUP, 3).is_some()
            && consumers.iter().all(is_stable))
        .await
    );

    let expected: BTreeSet<_> = scenarios::all_partitions(6).into_iter().collect();
    let assignments = scenarios::stable_assignments(&broker, GROUP, 3).unwrap();
    let violations = check_assignment(&expected, &assignments);
    assert!(violations.is_empty(), "violations: {violations:?}");
    for partitions in assignments.values() {
        assert_eq!(partitions.len(), 2);
    }

    for consumer in consumers {
        consumer.stop().await.unwrap();
    }
    assert!(broker.group_snapshot(GROUP).unwrap().members.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rebalance_member_leave_hands_over_partitions() {
    let broker = scenarios::broker(7, 4);
    let log = DeliveryLog::new();
    let first = RunningConsumer::start(&broker, ConsumerConfig::for_testing(), GROUP, log.handler(0));
    let second = RunningConsumer::start(&broker, ConsumerConfig::for_testing(), GROUP, log.handler(1));
    assert!(
        scenarios::wait_for(WAIT, || scenarios::stable_assignments(&broker, GROUP, 2).is_some()
            && is_stable(&first)
            && is_stable(&second))
        .await
    );

    let mut acknowledged = scenarios::produce(&broker, ProducerConfig::for_testing(), 40)
        .await
        .unwrap();
    assert!(scenarios::wait_for(WAIT, || log.distinct() == 40).await);

    second.stop().await.unwrap();
    assert!(
        scenarios::wait_for(WAIT, || first.consumer.assignment().len() == 4 && is_stable(&first))
            .await
    );

    acknowledged.extend(
        scenarios::produce(&broker, ProducerConfig::for_testing(), 40)
            .await
            .unwrap(),
    );
    assert!(scenarios::wait_for(WAIT, || log.distinct() == 80).await);
    first.stop().await.unwrap();

    let deliveries = log.snapshot();
    assert!(check_at_least_once(&acknowledged, &deliveries).is_empty());
    assert!(check_ordering(&deliveries).is_empty());
    for partition in scenarios::all_partitions(4) {
        assert_eq!(
            broker.committed(GROUP, &partition),
            broker.log_end_offset(&partition)
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rebalance_session_expiry_reassigns() {
    let broker = scenarios::broker(9, 2);
    let log = DeliveryLog::new();
    let survivor = RunningConsumer::start(&broker, ConsumerConfig::for_testing(), GROUP, log.handler(0));
    let doomed = RunningConsumer::start(&broker, ConsumerConfig::for_testing(), GROUP, log.handler(1));
    assert!(
        scenarios::wait_for(WAIT, || scenarios::stable_assignments(&broker, GROUP, 2).is_some()
            && is_stable(&survivor)
            && is_stable(&doomed))
        .await
    );

    doomed.crash();
    assert!(
        scenarios::wait_for(WAIT, || scenarios::stable_assignments(&broker, GROUP, 1).is_some()
            && survivor.consumer.assignment().len() == 2)
        .await
    );

    let acknowledged = scenarios::produce(&broker, ProducerConfig::for_testing(), 20)
        .await
        .unwrap();
    assert!(scenarios::wait_for(WAIT, || log.distinct() == 20).await);
    survivor.stop().await.unwrap();

    let deliveries = log.snapshot();
    assert!(check_at_least_once(&acknowledged, &deliveries).is_empty());
    assert!(deliveries.iter().all(|d| d.consumer == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rebalance_state_transitions_are_observable() {
    let broker = scenarios::broker(1, 2);
    let log = DeliveryLog::new();
    let first = RunningConsumer::start(&broker, ConsumerConfig::for_testing(), GROUP, log.handler(0));
    let mut states = first.consumer.watch_state();
    states
        .wait_for(|state| matches!(state, ConsumerState::Stable { .. }))
        .await
        .unwrap();

    let second = RunningConsumer::start(&broker, ConsumerConfig::for_testing(), GROUP, log.handler(1));
    let generation = tokio::time::timeout(
        WAIT,
        states.wait_for(|state| {
            matches!(state, ConsumerState::Stable { assignment, .. } if assignment.len() == 1)
        }),
    )
    .await
    .unwrap()
    .map(|state| match &*state {
        ConsumerState::Stable { generation, .. } => *generation,
        _ => unreachable!(),
    })
    .unwrap();
    assert_eq!(
        broker.group_snapshot(GROUP).map(|snapshot| snapshot.generation),
        Some(generation)
    );

    let consumer = std::sync::Arc::clone(&first.consumer);
    second.stop().await.unwrap();
    first.stop().await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Closed);
}

/// Counts handler calls and the most that ever ran at once.
#[derive(Debug, Default)]
struct Concurrency {
    started: AtomicUsize,
    finished: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rebalance_detached_handler_keeps_partition_busy() {
    let broker = scenarios::broker(21, 1);
    broker.create_topic("other", 1).unwrap();
    scenarios::produce(&broker, ProducerConfig::for_testing(), 1)
        .await
        .unwrap();
    let partition = TopicPartition::new(TOPIC, PartitionId::new(0));

    // Only session ends commit, and the grace period is far shorter than
    // the handler.
    let config = ConsumerConfig::for_testing()
        .with_commit_mode(CommitMode::AutoInterval(Duration::from_secs(3600)))
        .with_shutdown_grace(Duration::from_millis(20));
    let calls = Arc::new(Concurrency::default());
    let slow = RunningConsumer::start(&broker, config, GROUP, {
        let calls = Arc::clone(&calls);
        move |_message: Message<String>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.started.fetch_add(1, Ordering::SeqCst);
                let running = calls.running.fetch_add(1, Ordering::SeqCst) + 1;
                calls.max_running.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(800)).await;
                calls.running.fetch_sub(1, Ordering::SeqCst);
                calls.finished.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        }
    });
    assert!(scenarios::wait_for(WAIT, || calls.started.load(Ordering::SeqCst) == 1).await);
    let ConsumerState::Stable { generation, .. } = slow.consumer.state() else {
        panic!("consumer not stable while handling");
    };

    // A member of another topic forces a rebalance that hands t/0 back.
    let log = DeliveryLog::new();
    let other = Arc::new(Consumer::new(Arc::clone(&broker), ConsumerConfig::for_testing()).unwrap());
    other
        .subscribe(["other"], GROUP, StringCodec, log.handler(1))
        .unwrap();
    let other_task = {
        let other = Arc::clone(&other);
        tokio::spawn(async move { other.run().await })
    };
    assert!(
        scenarios::wait_for(WAIT, || {
            matches!(
                slow.consumer.state(),
                ConsumerState::Stable { generation: current, ref assignment }
                    if current != generation && assignment.as_slice() == [partition.clone()]
            )
        })
        .await
    );
    // The running partition was left out of the rebalance commit.
    assert_eq!(broker.committed(GROUP, &partition), None);

    assert!(scenarios::wait_for(WAIT, || calls.finished.load(Ordering::SeqCst) == 2).await);
    other.close().await;
    other_task.await.unwrap().unwrap();
    slow.stop().await.unwrap();

    assert_eq!(calls.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(calls.started.load(Ordering::SeqCst), 2);
    assert_eq!(broker.committed(GROUP, &partition), Some(Offset::new(1)));
}
