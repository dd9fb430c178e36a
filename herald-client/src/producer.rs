//! Producer client.
//!
//! `send` validates a record and hands it to a background accumulator task
//! without blocking; the caller gets a [`DeliveryHandle`] to await.
//!
//! The accumulator:
//! - picks a partition (hash of the key, else the configured partitioner),
//! - batches records per partition,
//! - flushes a batch when it reaches `batch_max_records` /
//!   `batch_max_bytes` or when its oldest record has lingered long enough,
//! - appends with retry and resolves every handle in the batch.
//!
//! # Acknowledgment Modes
//!
//! - `Acks::None`: resolved once appended, report carries no offset
//! - `Acks::Leader`: wait for the partition leader to write
//! - `Acks::All`: wait for all in-sync replicas

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use herald_broker::{Acks, Broker, BrokerError};
use herald_core::{BatchId, Offset, PartitionId, Record, TopicPartition};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use xxhash_rust::xxh3::xxh3_64;

use crate::codec::Serializer;
use crate::config::{Partitioner, ProducerConfig};
use crate::error::{ClientError, ClientResult};

// -----------------------------------------------------------------------------
// Delivery Handles
// -----------------------------------------------------------------------------

/// Where a record ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Topic name.
    pub topic: String,
    /// Partition the record was appended to.
    pub partition: PartitionId,
    /// Offset assigned by the broker; `None` under `Acks::None`.
    pub offset: Option<Offset>,
}

/// Current state of a [`DeliveryHandle`].
#[derive(Debug, Clone)]
pub enum DeliveryStatus {
    /// Not resolved yet.
    Pending,
    /// The broker confirmed the record.
    Acknowledged(DeliveryReport),
    /// The record will not be delivered.
    Failed(ClientError),
}

type DeliveryResult = ClientResult<DeliveryReport>;

/// One in-flight record.
///
/// Await the handle (or call [`wait`](Self::wait)) for the outcome, or
/// poll it without blocking through [`status`](Self::status).
#[derive(Debug)]
pub struct DeliveryHandle {
    receiver: oneshot::Receiver<DeliveryResult>,
    resolved: Option<DeliveryResult>,
}

impl DeliveryHandle {
    fn channel() -> (oneshot::Sender<DeliveryResult>, Self) {
        let (sender, receiver) = oneshot::channel();
        (
            sender,
            Self {
                receiver,
                resolved: None,
            },
        )
    }

    fn failed(err: ClientError) -> Self {
        let (_, mut handle) = Self::channel();
        handle.resolved = Some(Err(err));
        handle
    }

    /// Returns the current state without waiting.
    pub fn status(&mut self) -> DeliveryStatus {
        if self.resolved.is_none() {
            match self.receiver.try_recv() {
                Ok(result) => self.resolved = Some(result),
                Err(oneshot::error::TryRecvError::Empty) => return DeliveryStatus::Pending,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.resolved = Some(Err(ClientError::Closed));
                }
            }
        }

        match &self.resolved {
            Some(Ok(report)) => DeliveryStatus::Acknowledged(report.clone()),
            Some(Err(err)) => DeliveryStatus::Failed(err.clone()),
            None => DeliveryStatus::Pending,
        }
    }

    /// Waits for the outcome.
    ///
    /// # Errors
    /// Returns the delivery failure.
    pub async fn wait(self) -> DeliveryResult {
        self.await
    }
}

impl Future for DeliveryHandle {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.resolved.take() {
            return Poll::Ready(result);
        }
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(ClientError::Closed)))
    }
}

// -----------------------------------------------------------------------------
// Producer
// -----------------------------------------------------------------------------

struct PendingSend {
    record: Record,
    reply: oneshot::Sender<DeliveryResult>,
}

enum Command {
    Send(PendingSend),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Sends records to a broker.
///
/// Must be created inside a tokio runtime: construction spawns the
/// accumulator task.
#[derive(Debug)]
pub struct Producer {
    commands: mpsc::Sender<Command>,
    config: ProducerConfig,
    in_flight: Arc<AtomicU32>,
    closed: AtomicBool,
    span: Span,
}

impl Producer {
    /// Creates a producer.
    ///
    /// # Errors
    /// Returns `Configuration` if the config is invalid.
    pub fn new<B: Broker>(broker: Arc<B>, config: ProducerConfig) -> ClientResult<Self> {
        Self::with_span(broker, config, info_span!("producer"))
    }

    /// Creates a producer whose work is recorded under `span`.
    ///
    /// # Errors
    /// Returns `Configuration` if the config is invalid.
    pub fn with_span<B: Broker>(
        broker: Arc<B>,
        config: ProducerConfig,
        span: Span,
    ) -> ClientResult<Self> {
        config.validate()?;

        let (commands, receiver) = mpsc::channel(config.buffer_capacity as usize);
        let in_flight = Arc::new(AtomicU32::new(0));
        let accumulator = Accumulator {
            broker,
            config: config.clone(),
            in_flight: Arc::clone(&in_flight),
            batches: HashMap::new(),
            partition_counts: HashMap::new(),
            round_robin: HashMap::new(),
            sticky: HashMap::new(),
            next_batch_id: BatchId::new(1),
        };
        tokio::spawn(accumulator.run(receiver).instrument(span.clone()));

        span.in_scope(|| {
            info!(
                bootstrap_servers = ?config.bootstrap_servers,
                acks = ?config.acks,
                partitioner = ?config.partitioner,
                "Producer started"
            );
        });

        Ok(Self {
            commands,
            config,
            in_flight,
            closed: AtomicBool::new(false),
            span,
        })
    }

    /// Returns the producer configuration.
    #[must_use]
    pub const fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Queues a record for delivery. Never blocks.
    ///
    /// Validation failures, a full buffer or a closed producer are reported
    /// through an already-failed handle.
    pub fn send(&self, record: Record) -> DeliveryHandle {
        if self.closed.load(Ordering::Acquire) {
            return DeliveryHandle::failed(ClientError::Closed);
        }
        if let Err(err) = record.validate(&self.config.limits) {
            return DeliveryHandle::failed(ClientError::from_record_error(err));
        }

        let capacity = self.config.buffer_capacity;
        let reserved = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            });
        if reserved.is_err() {
            return DeliveryHandle::failed(ClientError::BufferFull { capacity });
        }

        let (reply, handle) = DeliveryHandle::channel();
        match self.commands.try_send(Command::Send(PendingSend { record, reply })) {
            Ok(()) => handle,
            Err(err) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        DeliveryHandle::failed(ClientError::BufferFull { capacity })
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        DeliveryHandle::failed(ClientError::Closed)
                    }
                }
            }
        }
    }

    /// Serializes a key and value, then queues the record.
    pub fn send_serialized<K, V>(
        &self,
        topic: &str,
        key: Option<&K>,
        value: &V,
        key_serializer: &impl Serializer<K>,
        value_serializer: &impl Serializer<V>,
    ) -> DeliveryHandle
    where
        K: ?Sized,
        V: ?Sized,
    {
        let key: Option<Bytes> = match key.map(|k| key_serializer.serialize(k)).transpose() {
            Ok(key) => key,
            Err(err) => return DeliveryHandle::failed(ClientError::Serialization(err)),
        };
        let value = match value_serializer.serialize(value) {
            Ok(value) => value,
            Err(err) => return DeliveryHandle::failed(ClientError::Serialization(err)),
        };

        let record = match key {
            Some(key) => Record::with_key(topic, key, value),
            None => Record::new(topic, value),
        };
        self.send(record)
    }

    /// Flushes every pending batch and waits for the appends to finish.
    ///
    /// # Errors
    /// Returns `Closed` if the producer was closed.
    pub async fn flush(&self) -> ClientResult<()> {
        let (done, wait) = oneshot::channel();
        self.commands
            .send(Command::Flush(done))
            .await
            .map_err(|_| ClientError::Closed)?;
        wait.await.map_err(|_| ClientError::Closed)
    }

    /// Flushes pending records and stops the producer.
    ///
    /// Later sends fail with `Closed`. Closing twice is a no-op.
    ///
    /// # Errors
    /// Returns `Closed` if the accumulator already stopped.
    pub async fn close(&self) -> ClientResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (done, wait) = oneshot::channel();
        self.commands
            .send(Command::Close(done))
            .await
            .map_err(|_| ClientError::Closed)?;
        wait.await.map_err(|_| ClientError::Closed)?;

        self.span.in_scope(|| info!("Producer closed"));
        Ok(())
    }

    /// Returns the number of records sent but not yet resolved.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire) as usize
    }
}

// -----------------------------------------------------------------------------
// Accumulator
// -----------------------------------------------------------------------------

/// A batch being accumulated for one partition.
struct PendingBatch {
    sends: Vec<PendingSend>,
    size_bytes: usize,
    created: Instant,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            sends: Vec::new(),
            size_bytes: 0,
            created: Instant::now(),
        }
    }

    fn can_add(&self, record_size: usize, config: &ProducerConfig) -> bool {
        self.sends.len() < config.batch_max_records as usize
            && self.size_bytes + record_size <= config.batch_max_bytes as usize
    }

    fn is_full(&self, config: &ProducerConfig) -> bool {
        self.sends.len() >= config.batch_max_records as usize
            || self.size_bytes >= config.batch_max_bytes as usize
    }

    fn add(&mut self, send: PendingSend, record_size: usize) {
        self.size_bytes += record_size;
        self.sends.push(send);
    }
}

struct Accumulator<B: Broker> {
    broker: Arc<B>,
    config: ProducerConfig,
    in_flight: Arc<AtomicU32>,
    batches: HashMap<TopicPartition, PendingBatch>,
    partition_counts: HashMap<String, u32>,
    round_robin: HashMap<String, u64>,
    sticky: HashMap<String, PartitionId>,
    next_batch_id: BatchId,
}

impl<B: Broker> Accumulator<B> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        const IDLE: Duration = Duration::from_secs(3600);

        loop {
            let deadline = self.next_deadline();
            let command = tokio::select! {
                command = commands.recv() => command,
                () = sleep_until(deadline.unwrap_or_else(|| Instant::now() + IDLE)), if deadline.is_some() => {
                    self.flush_expired().await;
                    continue;
                }
            };

            match command {
                Some(Command::Send(send)) => self.enqueue(send).await,
                Some(Command::Flush(done)) => {
                    self.flush_all().await;
                    let _ = done.send(());
                }
                Some(Command::Close(done)) => {
                    commands.close();
                    self.drain(&mut commands).await;
                    self.flush_all().await;
                    let _ = done.send(());
                    break;
                }
                None => {
                    self.flush_all().await;
                    break;
                }
            }
        }

        debug!("Producer accumulator stopped");
    }

    /// Handles commands queued before a close.
    async fn drain(&mut self, commands: &mut mpsc::Receiver<Command>) {
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Send(send) => self.enqueue(send).await,
                Command::Flush(done) | Command::Close(done) => {
                    let _ = done.send(());
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.batches
            .values()
            .map(|batch| batch.created + self.config.linger)
            .min()
    }

    async fn enqueue(&mut self, send: PendingSend) {
        let topic = send.record.topic().to_string();
        let count = match self.partition_count(&topic).await {
            Ok(count) => count,
            Err(err) => {
                warn!(topic = %topic, error = %err, "Failed to resolve partitions");
                self.resolve(send.reply, Err(err));
                return;
            }
        };

        let partition = self.select_partition(&send.record, count);
        let tp = TopicPartition::new(topic, partition);
        let record_size = send.record.size();

        if self
            .batches
            .get(&tp)
            .is_some_and(|batch| !batch.can_add(record_size, &self.config))
        {
            self.flush_partition(&tp).await;
        }

        let full = {
            let batch = self.batches.entry(tp.clone()).or_insert_with(PendingBatch::new);
            batch.add(send, record_size);
            batch.is_full(&self.config)
        };
        if full {
            self.flush_partition(&tp).await;
        }
    }

    async fn partition_count(&mut self, topic: &str) -> ClientResult<u32> {
        if let Some(&count) = self.partition_counts.get(topic) {
            return Ok(count);
        }

        let broker = &self.broker;
        let count = self
            .config
            .retry
            .run("partition_count", || broker.partition_count(topic))
            .await
            .map_err(|err| ClientError::delivery(err.source, err.attempts))?;
        if count == 0 {
            return Err(ClientError::Broker(BrokerError::UnknownTopic {
                topic: topic.to_string(),
            }));
        }

        self.partition_counts.insert(topic.to_string(), count);
        Ok(count)
    }

    fn select_partition(&mut self, record: &Record, partition_count: u32) -> PartitionId {
        if let Some(key) = record.key() {
            return key_partition(key, partition_count);
        }

        match self.config.partitioner {
            Partitioner::RoundRobin => self.next_round_robin(record.topic(), partition_count),
            Partitioner::Sticky => {
                if let Some(&partition) = self.sticky.get(record.topic()) {
                    return partition;
                }
                let partition = self.next_round_robin(record.topic(), partition_count);
                self.sticky.insert(record.topic().to_string(), partition);
                partition
            }
        }
    }

    fn next_round_robin(&mut self, topic: &str, partition_count: u32) -> PartitionId {
        let counter = self.round_robin.entry(topic.to_string()).or_insert(0);
        let partition = *counter % u64::from(partition_count);
        *counter = counter.wrapping_add(1);
        PartitionId::new(partition)
    }

    async fn flush_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<TopicPartition> = self
            .batches
            .iter()
            .filter(|(_, batch)| batch.created + self.config.linger <= now)
            .map(|(tp, _)| tp.clone())
            .collect();

        for tp in &expired {
            self.flush_partition(tp).await;
        }
    }

    async fn flush_all(&mut self) {
        let mut pending: Vec<TopicPartition> = self.batches.keys().cloned().collect();
        pending.sort();
        for tp in &pending {
            self.flush_partition(tp).await;
        }
    }

    async fn flush_partition(&mut self, tp: &TopicPartition) {
        let Some(batch) = self.batches.remove(tp) else {
            return;
        };
        if self.sticky.get(&tp.topic) == Some(&tp.partition) {
            self.sticky.remove(&tp.topic);
        }

        let batch_id = self.next_batch_id;
        self.next_batch_id = batch_id.next();

        let (mut records, mut replies): (Vec<Record>, Vec<_>) = batch
            .sends
            .into_iter()
            .map(|send| (send.record, send.reply))
            .unzip();
        let acks = self.config.acks;

        loop {
            let record_count = records.len();
            let broker = &self.broker;
            let result = self
                .config
                .retry
                .run("append", || broker.append(tp, records.clone(), acks))
                .await;

            let err = match result {
                Ok(base_offset) => {
                    debug!(
                        batch_id = %batch_id,
                        partition = %tp,
                        base_offset = %base_offset,
                        records = record_count,
                        "Batch delivered"
                    );
                    for (index, reply) in (0u64..).zip(replies) {
                        let offset = (acks != Acks::None).then(|| base_offset.advance(index));
                        let report = DeliveryReport {
                            topic: tp.topic.clone(),
                            partition: tp.partition,
                            offset,
                        };
                        self.resolve(reply, Ok(report));
                    }
                    return;
                }
                Err(err) => err,
            };

            // An oversized record fails alone; the rest of the batch is resent.
            if let BrokerError::RecordTooLarge { max, .. } = err.source {
                let (kept_records, kept_replies) = self.reject_oversized(records, replies, max);
                if kept_records.is_empty() {
                    return;
                }
                let shrunk = kept_records.len() < record_count;
                records = kept_records;
                replies = kept_replies;
                if shrunk {
                    debug!(
                        batch_id = %batch_id,
                        partition = %tp,
                        records = records.len(),
                        "Resending batch without oversized records"
                    );
                    continue;
                }
            }

            let exhausted = err.is_exhausted();
            let failure = ClientError::delivery(err.source, err.attempts);
            if exhausted {
                error!(
                    batch_id = %batch_id,
                    partition = %tp,
                    records = record_count,
                    error = %failure,
                    "Batch delivery failed, retries exhausted"
                );
            } else {
                warn!(
                    batch_id = %batch_id,
                    partition = %tp,
                    records = record_count,
                    error = %failure,
                    "Batch rejected"
                );
            }
            for reply in replies {
                self.resolve(reply, Err(failure.clone()));
            }
            return;
        }
    }

    /// Fails every record larger than `max` and returns the others.
    fn reject_oversized(
        &self,
        records: Vec<Record>,
        replies: Vec<oneshot::Sender<DeliveryResult>>,
        max: usize,
    ) -> (Vec<Record>, Vec<oneshot::Sender<DeliveryResult>>) {
        let mut kept = (Vec::with_capacity(records.len()), Vec::with_capacity(replies.len()));
        for (record, reply) in records.into_iter().zip(replies) {
            let size = record.size();
            if size > max {
                warn!(topic = %record.topic(), size, max, "Record rejected by broker as too large");
                self.resolve(reply, Err(ClientError::RecordTooLarge { size, max }));
            } else {
                kept.0.push(record);
                kept.1.push(reply);
            }
        }
        kept
    }

    fn resolve(&self, reply: oneshot::Sender<DeliveryResult>, result: DeliveryResult) {
        // The caller may have dropped the handle.
        let _ = reply.send(result);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Maps a key to a partition.
///
/// Uses xxh3 so the mapping stays stable across builds and toolchains.
fn key_partition(key: &[u8], partition_count: u32) -> PartitionId {
    PartitionId::new(xxh3_64(key) % u64::from(partition_count))
}
