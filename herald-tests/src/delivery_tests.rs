//! Delivery guarantee tests.
//!
//! End-to-end producer to consumer runs against `SimulatedBroker`:
//! - every acknowledged record is delivered at least once
//! - records of a partition arrive in offset order
//! - manual commits never pass a record whose handler did not complete,
//!   across clean restarts and crashes

#![allow(clippy::too_many_lines)]

use std::sync::Arc;
use std::time::Duration;

use herald_client::{
    CommitMode, ConsumerConfig, Message, MessageHandler, Producer, ProducerConfig,
};
use herald_core::{Offset, PartitionId, Record, TopicPartition};

use crate::properties::{
    check_at_least_once, check_commit_bound, check_no_duplicates, check_ordering,
};
use crate::scenarios::{self, DeliveryLog, RunningConsumer, GROUP, TOPIC};

const WAIT: Duration = Duration::from_secs(10);

fn tp(partition: u64) -> TopicPartition {
    TopicPartition::new(TOPIC, PartitionId::new(partition))
}

fn manual() -> ConsumerConfig {
    ConsumerConfig::for_testing().with_commit_mode(CommitMode::ManualAfterSuccess)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delivery_at_least_once_in_order() {
    let broker = scenarios::broker(42, 3);
    let acknowledged = scenarios::produce(&broker, ProducerConfig::for_testing(), 60)
        .await
        .unwrap();
    assert_eq!(acknowledged.len(), 60);

    let log = DeliveryLog::new();
    let consumer = RunningConsumer::start(&broker, ConsumerConfig::for_testing(), GROUP, log.handler(0));
    assert!(scenarios::wait_for(WAIT, || log.distinct() == 60).await);
    consumer.stop().await.unwrap();

    let deliveries = log.snapshot();
    let lost = check_at_least_once(&acknowledged, &deliveries);
    assert!(lost.is_empty(), "lost records: {lost:?}");
    let disorder = check_ordering(&deliveries);
    assert!(disorder.is_empty(), "out of order: {disorder:?}");

    for partition in scenarios::all_partitions(3) {
        assert_eq!(
            broker.committed(GROUP, &partition),
            broker.log_end_offset(&partition),
            "final commit for {partition}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delivery_single_record_exactly_once() {
    let broker = scenarios::broker(7, 1);
    let producer = Producer::new(Arc::clone(&broker), ProducerConfig::for_testing()).unwrap();
    let report = producer.send(Record::new(TOPIC, "hello")).await.unwrap();
    assert_eq!(report.offset, Some(Offset::new(0)));

    let log = DeliveryLog::new();
    let consumer = RunningConsumer::start(&broker, ConsumerConfig::for_testing(), GROUP, log.handler(0));
    assert!(scenarios::wait_for(WAIT, || log.len() == 1).await);
    // Give a duplicate the chance to show up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    consumer.stop().await.unwrap();
    producer.close().await.unwrap();

    let deliveries = log.snapshot();
    assert!(check_no_duplicates(&deliveries).is_empty());
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].value, "hello");
    assert_eq!(deliveries[0].partition, tp(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delivery_keyed_records_keep_production_order() {
    let broker = scenarios::broker(3, 4);
    let producer = Producer::new(Arc::clone(&broker), ProducerConfig::for_testing()).unwrap();
    let handles: Vec<_> = (0..20)
        .map(|i| producer.send(Record::with_key(TOPIC, "customer-7", format!("{i}"))))
        .collect();
    let mut partitions = Vec::new();
    for handle in handles {
        partitions.push(handle.await.unwrap().partition);
    }
    partitions.dedup();
    assert_eq!(partitions.len(), 1);

    let log = DeliveryLog::new();
    let consumer = RunningConsumer::start(&broker, ConsumerConfig::for_testing(), GROUP, log.handler(0));
    assert!(scenarios::wait_for(WAIT, || log.len() == 20).await);
    consumer.stop().await.unwrap();
    producer.close().await.unwrap();

    let values: Vec<String> = log.snapshot().into_iter().map(|d| d.value).collect();
    let expected: Vec<String> = (0..20).map(|i| format!("{i}")).collect();
    assert_eq!(values, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delivery_manual_failure_redelivered_after_restart() {
    let broker = scenarios::broker(5, 1);
    scenarios::produce(&broker, ProducerConfig::for_testing(), 10)
        .await
        .unwrap();

    // The first consumer keeps failing at offset 5.
    let first_log = DeliveryLog::new();
    let first = RunningConsumer::start(
        &broker,
        manual(),
        GROUP,
        first_log.failing_handler(0, |message| message.offset == Offset::new(5)),
    );
    assert!(scenarios::wait_for(WAIT, || first_log.len() == 5).await);
    assert!(scenarios::wait_for(WAIT, || broker.committed(GROUP, &tp(0)) == Some(Offset::new(5))).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    first.stop().await.unwrap();

    let committed = broker.committed(GROUP, &tp(0));
    assert_eq!(check_commit_bound(&tp(0), committed, Offset::new(5)), None);
    let offsets: Vec<u64> = first_log.snapshot().iter().map(|d| d.offset.get()).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);

    // After a restart offset 5 comes first.
    let second_log = DeliveryLog::new();
    let second = RunningConsumer::start(&broker, manual(), GROUP, second_log.handler(1));
    assert!(scenarios::wait_for(WAIT, || second_log.len() == 5).await);
    second.stop().await.unwrap();

    let offsets: Vec<u64> = second_log.snapshot().iter().map(|d| d.offset.get()).collect();
    assert_eq!(offsets, vec![5, 6, 7, 8, 9]);
    assert_eq!(broker.committed(GROUP, &tp(0)), Some(Offset::new(10)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delivery_crash_never_skips_unhandled_record() {
    let broker = scenarios::broker(11, 1);
    let acknowledged = scenarios::produce(&broker, ProducerConfig::for_testing(), 8)
        .await
        .unwrap();

    // The handler never finishes offset 3, which starts the second batch.
    let first_log = DeliveryLog::new();
    let recorder = Arc::new(first_log.handler(0));
    let first = RunningConsumer::start(
        &broker,
        manual().with_max_poll_records(3),
        GROUP,
        move |message: Message<String>| {
            let recorder = Arc::clone(&recorder);
            async move {
                if message.offset == Offset::new(3) {
                    std::future::pending::<()>().await;
                }
                recorder.handle(message).await
            }
        },
    );
    assert!(scenarios::wait_for(WAIT, || broker.committed(GROUP, &tp(0)) == Some(Offset::new(3))).await);
    first.crash();

    let committed = broker.committed(GROUP, &tp(0));
    assert_eq!(check_commit_bound(&tp(0), committed, Offset::new(3)), None);

    // The replacement waits for the crashed member's session to expire.
    let second_log = DeliveryLog::new();
    let second = RunningConsumer::start(&broker, manual(), GROUP, second_log.handler(1));
    assert!(scenarios::wait_for(WAIT, || second_log.len() == 5).await);
    second.stop().await.unwrap();

    let offsets: Vec<u64> = second_log.snapshot().iter().map(|d| d.offset.get()).collect();
    assert_eq!(offsets, vec![3, 4, 5, 6, 7]);

    let mut all = first_log.snapshot();
    all.extend(second_log.snapshot());
    assert!(check_at_least_once(&acknowledged, &all).is_empty());
}
