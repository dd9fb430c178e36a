//! Consumer client.
//!
//! A consumer joins a group, receives partitions from the broker's group
//! coordinator and delivers their records to a handler on a bounded worker
//! pool. At most one batch per partition is in flight, so records of a
//! partition reach the handler in offset order while partitions proceed
//! independently.
//!
//! # Lifecycle
//!
//! ```text
//! Joining ──► Stable ──► Rebalancing ──► Joining ...
//!    │           │
//!    └───────────┴──► Closed
//! ```
//!
//! Leaving `Stable` always drains in-flight batches (bounded by
//! `shutdown_grace`), commits final offsets and drops the assignment.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use herald_broker::{
    Assignment, Broker, BrokerError, HeartbeatOutcome, JoinGroupRequest, JoinOutcome,
};
use herald_core::{ConsumedRecord, GenerationId, MemberId, Offset, TopicPartition};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, timeout_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument, Span};

use crate::codec::Deserializer;
use crate::commit::CommitCoordinator;
use crate::config::{CommitMode, ConsumerConfig, OffsetReset};
use crate::dispatch::{Dispatch, MessageHandler, Outcome, TypedDispatch};
use crate::error::{ClientError, ClientResult, CommitError};
use crate::retry::RetryError;

// -----------------------------------------------------------------------------
// State
// -----------------------------------------------------------------------------

/// Observable consumer state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    /// Joining the group (also the state before `run`).
    Joining,
    /// Consuming an assignment.
    Stable {
        /// Group generation of the assignment.
        generation: GenerationId,
        /// Assigned partitions.
        assignment: Vec<TopicPartition>,
    },
    /// Draining the previous assignment before rejoining.
    Rebalancing,
    /// Stopped for good.
    Closed,
}

#[derive(Clone)]
struct Subscription {
    group_id: String,
    topics: BTreeSet<String>,
    dispatch: Arc<dyn Dispatch>,
}

#[derive(Debug, Clone)]
struct Membership {
    group_id: String,
    member_id: MemberId,
    generation: GenerationId,
}

/// Why a session ended.
#[derive(Debug)]
enum SessionExit {
    Rebalance,
    MembershipLost,
    Stalled(ClientError),
    Shutdown,
}

/// Result of one partition batch.
struct BatchResult {
    partition: TopicPartition,
    /// First record that must be delivered again.
    failed: Option<Offset>,
}

// -----------------------------------------------------------------------------
// Consumer
// -----------------------------------------------------------------------------

/// Consumes records as a member of a consumer group.
///
/// Call [`subscribe`](Self::subscribe), then drive the consumer with
/// [`run`](Self::run) (typically on its own task) and stop it with
/// [`close`](Self::close).
pub struct Consumer<B: Broker> {
    broker: Arc<B>,
    config: ConsumerConfig,
    span: Span,
    subscription: Mutex<Option<Subscription>>,
    state: watch::Sender<ConsumerState>,
    shutdown: watch::Sender<bool>,
    offsets: Arc<Mutex<CommitCoordinator>>,
    paused: Mutex<HashSet<TopicPartition>>,
    /// Partitions with a running batch, including batches detached from an
    /// earlier session.
    in_flight: Arc<Mutex<HashSet<TopicPartition>>>,
    membership: Mutex<Option<Membership>>,
    running: AtomicBool,
}

impl<B: Broker> std::fmt::Debug for Consumer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("state", &*self.state.borrow())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: Broker> Consumer<B> {
    /// Creates a consumer.
    ///
    /// # Errors
    /// Returns `Configuration` if the config is invalid.
    pub fn new(broker: Arc<B>, config: ConsumerConfig) -> ClientResult<Self> {
        config.validate()?;

        let (state, _) = watch::channel(ConsumerState::Joining);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            broker,
            config,
            span: info_span!("consumer"),
            subscription: Mutex::new(None),
            state,
            shutdown,
            offsets: Arc::new(Mutex::new(CommitCoordinator::new())),
            paused: Mutex::new(HashSet::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            membership: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Records the consumer's work under `span`.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Returns the consumer configuration.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Sets the topics, group and handler used by [`run`](Self::run).
    ///
    /// # Errors
    /// Returns `Configuration` for an empty group id or topic list, or if
    /// the consumer is already running.
    ///
    /// # Panics
    /// Panics if the subscription lock is poisoned.
    pub fn subscribe<D, H>(
        &self,
        topics: impl IntoIterator<Item = impl Into<String>>,
        group_id: impl Into<String>,
        deserializer: D,
        handler: H,
    ) -> ClientResult<()>
    where
        D: Deserializer,
        H: MessageHandler<D::Output>,
    {
        let group_id = group_id.into();
        if group_id.is_empty() {
            return Err(ClientError::configuration("group_id", "must not be empty"));
        }
        let topics: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() || topics.iter().any(String::is_empty) {
            return Err(ClientError::configuration(
                "topics",
                "must name at least one non-empty topic",
            ));
        }
        if self.running.load(Ordering::Acquire) {
            return Err(ClientError::configuration(
                "subscription",
                "cannot change while the consumer is running",
            ));
        }

        *self.subscription.lock().expect("subscription lock poisoned") = Some(Subscription {
            group_id,
            topics,
            dispatch: Arc::new(TypedDispatch::new(deserializer, handler)),
        });
        Ok(())
    }

    /// Runs the consumer until [`close`](Self::close) is called.
    ///
    /// # Errors
    /// Returns `Configuration` without a subscription or if already
    /// running, `Closed` if the consumer was closed, and non-retryable
    /// broker errors raised while joining (a full group, for example).
    ///
    /// # Panics
    /// Panics if an internal lock is poisoned.
    pub async fn run(&self) -> ClientResult<()> {
        let subscription = self
            .subscription
            .lock()
            .expect("subscription lock poisoned")
            .clone()
            .ok_or_else(|| ClientError::configuration("subscription", "call subscribe before run"))?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ClientError::configuration("run", "consumer is already running"));
        }
        if *self.shutdown.borrow() {
            self.running.store(false, Ordering::Release);
            return Err(ClientError::Closed);
        }

        let span = self.span.clone();
        let mut member_id = None;
        let result = async {
            info!(
                group_id = %subscription.group_id,
                topics = ?subscription.topics,
                "Consumer started"
            );
            let result = self.run_sessions(&subscription, &mut member_id).await;
            if let Some(member_id) = member_id {
                if let Err(err) = self
                    .broker
                    .leave_group(&subscription.group_id, member_id)
                    .await
                {
                    warn!(group_id = %subscription.group_id, error = %err, "Failed to leave group");
                }
            }
            info!(group_id = %subscription.group_id, "Consumer closed");
            result
        }
        .instrument(span)
        .await;

        self.state.send_replace(ConsumerState::Closed);
        self.running.store(false, Ordering::Release);
        result
    }

    /// Stops the consumer and waits for [`run`](Self::run) to finish.
    ///
    /// In-flight handlers get `shutdown_grace` to complete; final offsets
    /// are committed and the group is left.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        if !self.running.load(Ordering::Acquire) {
            self.state.send_replace(ConsumerState::Closed);
            return;
        }

        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConsumerState::Closed)
            .await
            .map(|_| ());
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.state.borrow().clone()
    }

    /// Returns a receiver that observes state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Returns the partitions currently assigned to this consumer.
    #[must_use]
    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.offsets().assigned()
    }

    /// Returns the last offset committed for an assigned partition.
    #[must_use]
    pub fn last_committed(&self, partition: &TopicPartition) -> Option<Offset> {
        self.offsets().last_committed(partition)
    }

    /// Commits `offset` (the next offset to consume) for a partition.
    ///
    /// # Errors
    /// Returns `Commit` if the partition is not assigned, the offset is past
    /// what was delivered or below the last commit, or there is no active
    /// membership. Broker failures are retried first.
    pub async fn commit(&self, partition: &TopicPartition, offset: Offset) -> ClientResult<()> {
        let membership = self.current_membership()?;
        self.offsets().commit(partition, offset)?;

        let pending = [(partition.clone(), offset)];
        self.send_commit(&membership, &pending).await
    }

    /// Commits everything the commit policy allows right now.
    ///
    /// # Errors
    /// Returns `Commit(NoMembership)` outside a session, or the broker
    /// failure after retries.
    pub async fn commit_now(&self) -> ClientResult<()> {
        let membership = self.current_membership()?;
        self.commit_pending(&membership, &HashSet::new()).await
    }

    /// Stops fetching a partition until [`resume`](Self::resume).
    ///
    /// A batch already handed to the worker pool still completes.
    ///
    /// # Errors
    /// Returns `Commit(NotAssigned)` if the partition is not assigned.
    ///
    /// # Panics
    /// Panics if the pause lock is poisoned.
    pub fn pause(&self, partition: &TopicPartition) -> ClientResult<()> {
        self.ensure_assigned(partition)?;
        self.paused
            .lock()
            .expect("pause lock poisoned")
            .insert(partition.clone());
        Ok(())
    }

    /// Resumes fetching a paused partition.
    ///
    /// # Errors
    /// Returns `Commit(NotAssigned)` if the partition is not assigned.
    ///
    /// # Panics
    /// Panics if the pause lock is poisoned.
    pub fn resume(&self, partition: &TopicPartition) -> ClientResult<()> {
        self.ensure_assigned(partition)?;
        self.paused
            .lock()
            .expect("pause lock poisoned")
            .remove(partition);
        Ok(())
    }

    /// Returns how many records of a partition are not fetched yet.
    ///
    /// # Errors
    /// Returns `Commit(NotAssigned)` if the partition is not assigned, or
    /// the broker failure after retries.
    pub async fn lag(&self, partition: &TopicPartition) -> ClientResult<u64> {
        let position = self
            .offsets()
            .position(partition)
            .ok_or_else(|| CommitError::NotAssigned {
                partition: partition.clone(),
            })?;

        let broker = &self.broker;
        let bounds = self
            .config
            .retry
            .run("log_bounds", || broker.log_bounds(partition))
            .await
            .map_err(stalled)?;
        Ok(bounds.end.get().saturating_sub(position.get()))
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    async fn run_sessions(
        &self,
        subscription: &Subscription,
        member_id: &mut Option<MemberId>,
    ) -> ClientResult<()> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            self.state.send_replace(ConsumerState::Joining);
            let Some(assignment) = self.join(subscription, member_id, &mut shutdown).await? else {
                return Ok(());
            };
            *member_id = Some(assignment.member_id);

            let membership = Membership {
                group_id: subscription.group_id.clone(),
                member_id: assignment.member_id,
                generation: assignment.generation,
            };

            if let Err(err) = self.initialize_positions(&membership, &assignment).await {
                error!(
                    group_id = %membership.group_id,
                    generation = %membership.generation,
                    error = %err,
                    "Failed to initialize positions"
                );
                self.offsets().revoke_all();
                self.state.send_replace(ConsumerState::Rebalancing);
                if self.pause_before_rejoin(&mut shutdown).await {
                    return Ok(());
                }
                continue;
            }

            info!(
                group_id = %membership.group_id,
                member_id = %membership.member_id,
                generation = %membership.generation,
                partitions = ?assignment.partitions,
                "Partitions assigned"
            );
            *self.membership.lock().expect("membership lock poisoned") = Some(membership.clone());
            self.state.send_replace(ConsumerState::Stable {
                generation: membership.generation,
                assignment: assignment.partitions.clone(),
            });

            let exit = self
                .consume(subscription, &membership, &assignment, &mut shutdown)
                .await;

            match exit {
                SessionExit::Shutdown => return Ok(()),
                SessionExit::Rebalance => {
                    info!(group_id = %membership.group_id, "Rebalance required, rejoining");
                    self.state.send_replace(ConsumerState::Rebalancing);
                }
                SessionExit::MembershipLost => {
                    warn!(group_id = %membership.group_id, "Group membership lost, rejoining");
                    *member_id = None;
                    self.state.send_replace(ConsumerState::Rebalancing);
                }
                SessionExit::Stalled(err) => {
                    error!(
                        group_id = %membership.group_id,
                        error = %err,
                        "Consumption stalled, dropping assignment"
                    );
                    self.state.send_replace(ConsumerState::Rebalancing);
                    if self.pause_before_rejoin(&mut shutdown).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Joins the group; `None` means shutdown was requested first.
    async fn join(
        &self,
        subscription: &Subscription,
        member_id: &mut Option<MemberId>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ClientResult<Option<Assignment>> {
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            let request = JoinGroupRequest {
                group_id: subscription.group_id.clone(),
                member_id: *member_id,
                topics: subscription.topics.clone(),
                session_timeout_us: self.config.session_timeout_us(),
            };

            let delay = match self.broker.join_group(request).await {
                Ok(JoinOutcome::Complete(assignment)) => return Ok(Some(assignment)),
                Ok(JoinOutcome::Pending { member_id: id }) => {
                    debug!(group_id = %subscription.group_id, member_id = %id, "Waiting for group");
                    *member_id = Some(id);
                    failures = 0;
                    self.config.poll_interval
                }
                Err(err) if err.is_membership_lost() => {
                    warn!(group_id = %subscription.group_id, error = %err, "Member unknown, joining as new member");
                    *member_id = None;
                    continue;
                }
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    if failures >= self.config.retry.max_attempts {
                        error!(
                            group_id = %subscription.group_id,
                            attempts = failures,
                            error = %err,
                            "Join retries exhausted, still trying"
                        );
                        failures = 0;
                    } else {
                        warn!(group_id = %subscription.group_id, attempt = failures, error = %err, "Join failed, retrying");
                    }
                    self.config.retry.backoff(failures.max(1))
                }
                Err(err) => {
                    error!(group_id = %subscription.group_id, error = %err, "Join rejected");
                    return Err(ClientError::Broker(err));
                }
            };

            tokio::select! {
                () = sleep(delay) => {}
                () = shutdown_requested(shutdown) => return Ok(None),
            }
        }
    }

    async fn initialize_positions(
        &self,
        membership: &Membership,
        assignment: &Assignment,
    ) -> ClientResult<()> {
        let broker = &self.broker;
        let retry = self.config.retry;

        for partition in &assignment.partitions {
            let committed = retry
                .run("committed_offset", || {
                    broker.committed_offset(&membership.group_id, partition)
                })
                .await
                .map_err(stalled)?;

            let start = match committed {
                Some(offset) => offset,
                None => {
                    let bounds = retry
                        .run("log_bounds", || broker.log_bounds(partition))
                        .await
                        .map_err(stalled)?;
                    match self.config.offset_reset {
                        OffsetReset::Earliest => bounds.start,
                        OffsetReset::Latest => bounds.end,
                    }
                }
            };

            debug!(partition = %partition, start = %start, committed = ?committed, "Initialized position");
            self.offsets().assign(partition.clone(), start, committed);
        }
        Ok(())
    }

    /// Waits out the retry backoff; true if shutdown was requested.
    async fn pause_before_rejoin(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            () = sleep(self.config.retry.max_backoff) => false,
            () = shutdown_requested(shutdown) => true,
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn consume(
        &self,
        subscription: &Subscription,
        membership: &Membership,
        assignment: &Assignment,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionExit {
        let revoked = Arc::new(AtomicBool::new(false));
        let workers = Arc::new(Semaphore::new(self.config.worker_count as usize));
        let mut tasks: JoinSet<BatchResult> = JoinSet::new();
        let mut backoff_until: HashMap<TopicPartition, Instant> = HashMap::new();
        let mut fetch_failures = 0u32;
        let mut heartbeat_failures = 0u32;

        let start = Instant::now();
        let mut heartbeat = interval_at(
            start + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut auto_commit = match self.config.commit_mode {
            CommitMode::AutoInterval(every) => {
                let mut interval = interval_at(start + every, every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(interval)
            }
            CommitMode::ManualAfterSuccess => None,
        };

        let exit = 'session: loop {
            // Hand every idle partition's next batch to the worker pool.
            for partition in &assignment.partitions {
                if self.is_in_flight(partition)
                    || self.is_paused(partition)
                    || backoff_until
                        .get(partition)
                        .is_some_and(|until| *until > Instant::now())
                {
                    continue;
                }
                let Ok(permit) = Arc::clone(&workers).try_acquire_owned() else {
                    break;
                };
                let Some(position) = self.offsets().position(partition) else {
                    continue;
                };

                let response = match self
                    .broker
                    .fetch(partition, position, self.config.max_poll_records)
                    .await
                {
                    Ok(response) => {
                        fetch_failures = 0;
                        backoff_until.remove(partition);
                        response
                    }
                    Err(BrokerError::OffsetOutOfRange {
                        log_start, log_end, ..
                    }) => {
                        let reset = match self.config.offset_reset {
                            OffsetReset::Earliest => log_start,
                            OffsetReset::Latest => log_end,
                        };
                        warn!(
                            partition = %partition,
                            position = %position,
                            reset = %reset,
                            "Fetch position out of range, resetting"
                        );
                        self.offsets().seek(partition, reset);
                        continue;
                    }
                    Err(err) if err.is_retryable() => {
                        fetch_failures += 1;
                        if fetch_failures >= self.config.retry.max_attempts {
                            break 'session SessionExit::Stalled(ClientError::ConsumptionStalled {
                                attempts: fetch_failures,
                                source: err,
                            });
                        }
                        let delay = self.config.retry.backoff(fetch_failures);
                        warn!(partition = %partition, attempt = fetch_failures, error = %err, "Fetch failed, backing off");
                        backoff_until.insert(partition.clone(), Instant::now() + delay);
                        continue;
                    }
                    Err(err) => {
                        warn!(partition = %partition, error = %err, "Fetch rejected, backing off");
                        backoff_until.insert(
                            partition.clone(),
                            Instant::now() + self.config.retry.max_backoff,
                        );
                        continue;
                    }
                };

                let Some(last) = response.records.last() else {
                    continue;
                };
                self.offsets().record_fetched(partition, last.offset.next());
                debug!(
                    partition = %partition,
                    from = %position,
                    records = response.records.len(),
                    "Dispatching batch"
                );

                let batch = BatchTask {
                    partition: partition.clone(),
                    dispatch: Arc::clone(&subscription.dispatch),
                    offsets: Arc::clone(&self.offsets),
                    revoked: Arc::clone(&revoked),
                    commit_mode: self.config.commit_mode,
                };
                let span = debug_span!(parent: &self.span, "batch", partition = %partition);
                let guard = InFlight::register(&self.in_flight, partition.clone());
                tasks.spawn(
                    async move {
                        let result = batch.run(response.records).await;
                        drop(permit);
                        drop(guard);
                        result
                    }
                    .instrument(span),
                );
            }

            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(result) => {
                            if let Some(offset) = result.failed {
                                self.offsets().rewind(&result.partition, offset);
                                backoff_until.insert(
                                    result.partition.clone(),
                                    Instant::now() + self.config.handler_retry_backoff,
                                );
                            }
                            if self.config.commit_mode == CommitMode::ManualAfterSuccess {
                                if let Some(exit) = self.commit_in_session(membership).await {
                                    break 'session exit;
                                }
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "Batch task failed, rebalancing");
                            break 'session SessionExit::Rebalance;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    match self
                        .broker
                        .heartbeat(&membership.group_id, membership.member_id, membership.generation)
                        .await
                    {
                        Ok(HeartbeatOutcome::Stable) => heartbeat_failures = 0,
                        Ok(HeartbeatOutcome::RebalanceRequired) => break 'session SessionExit::Rebalance,
                        Err(err) if err.is_membership_lost() => break 'session SessionExit::MembershipLost,
                        Err(err) if err.is_retryable() => {
                            heartbeat_failures += 1;
                            if heartbeat_failures >= self.config.retry.max_attempts {
                                break 'session SessionExit::Stalled(ClientError::ConsumptionStalled {
                                    attempts: heartbeat_failures,
                                    source: err,
                                });
                            }
                            warn!(attempt = heartbeat_failures, error = %err, "Heartbeat failed");
                        }
                        Err(err) => warn!(error = %err, "Heartbeat rejected"),
                    }
                }
                () = tick(&mut auto_commit) => {
                    if let Some(exit) = self.commit_in_session(membership).await {
                        break 'session exit;
                    }
                }
                () = shutdown_requested(shutdown) => break 'session SessionExit::Shutdown,
                () = sleep(self.config.poll_interval) => {}
            }
        };

        let commit = !matches!(exit, SessionExit::MembershipLost);
        self.end_session(membership, &mut tasks, &revoked, commit)
            .await;
        exit
    }

    /// Commits during a session; returns an exit if membership was lost.
    ///
    /// In-flight partitions are included: auto commits cover the delivered
    /// watermark and manual commits never pass an unacknowledged record.
    async fn commit_in_session(&self, membership: &Membership) -> Option<SessionExit> {
        match self.commit_pending(membership, &HashSet::new()).await {
            Ok(()) => None,
            Err(ClientError::Broker(err)) if err.is_membership_lost() => {
                Some(SessionExit::MembershipLost)
            }
            Err(err) => {
                warn!(group_id = %membership.group_id, error = %err, "Offset commit failed");
                None
            }
        }
    }

    /// Drains in-flight batches, commits and drops the assignment.
    async fn end_session(
        &self,
        membership: &Membership,
        tasks: &mut JoinSet<BatchResult>,
        revoked: &AtomicBool,
        commit: bool,
    ) {
        let deadline = Instant::now() + self.config.shutdown_grace;
        while !tasks.is_empty() {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(result))) => {
                    if let Some(offset) = result.failed {
                        self.offsets().rewind(&result.partition, offset);
                    }
                }
                Ok(Some(Err(err))) => error!(error = %err, "Batch task failed during drain"),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        running = tasks.len(),
                        partitions = ?self.in_flight_partitions(),
                        "Shutdown grace elapsed, detaching running handlers"
                    );
                    break;
                }
            }
        }

        // Detached batches stay in `in_flight` until their handler returns,
        // so no later session fetches their partition in the meantime.
        let running = self.in_flight_partitions();
        revoked.store(true, Ordering::Release);
        tasks.detach_all();

        if commit {
            // Partitions whose handlers are still running keep their last commit.
            if let Err(err) = self.commit_pending(membership, &running).await {
                warn!(group_id = %membership.group_id, error = %err, "Final offset commit failed");
            }
        }

        let revoked_partitions = {
            let mut offsets = self.offsets();
            let partitions = offsets.assigned();
            offsets.revoke_all();
            partitions
        };
        self.paused.lock().expect("pause lock poisoned").clear();
        *self.membership.lock().expect("membership lock poisoned") = None;

        info!(
            group_id = %membership.group_id,
            generation = %membership.generation,
            partitions = ?revoked_partitions,
            "Partitions revoked"
        );
    }

    // -------------------------------------------------------------------------
    // Commits
    // -------------------------------------------------------------------------

    async fn commit_pending(
        &self,
        membership: &Membership,
        exclude: &HashSet<TopicPartition>,
    ) -> ClientResult<()> {
        let pending: Vec<(TopicPartition, Offset)> = self
            .offsets()
            .pending_commits(self.config.commit_mode)
            .into_iter()
            .filter(|(partition, _)| !exclude.contains(partition))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        self.send_commit(membership, &pending).await
    }

    async fn send_commit(
        &self,
        membership: &Membership,
        pending: &[(TopicPartition, Offset)],
    ) -> ClientResult<()> {
        let broker = &self.broker;
        self.config
            .retry
            .run("commit_offsets", || {
                broker.commit_offsets(
                    &membership.group_id,
                    membership.member_id,
                    membership.generation,
                    pending,
                )
            })
            .await
            .map_err(stalled)?;

        let mut offsets = self.offsets();
        for (partition, offset) in pending {
            offsets.mark_committed(partition, *offset);
        }
        debug!(
            group_id = %membership.group_id,
            generation = %membership.generation,
            offsets = ?pending,
            "Committed offsets"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn offsets(&self) -> MutexGuard<'_, CommitCoordinator> {
        self.offsets.lock().expect("offsets lock poisoned")
    }

    fn current_membership(&self) -> ClientResult<Membership> {
        self.membership
            .lock()
            .expect("membership lock poisoned")
            .clone()
            .ok_or(ClientError::Commit(CommitError::NoMembership))
    }

    fn ensure_assigned(&self, partition: &TopicPartition) -> ClientResult<()> {
        if self.offsets().is_assigned(partition) {
            Ok(())
        } else {
            Err(ClientError::Commit(CommitError::NotAssigned {
                partition: partition.clone(),
            }))
        }
    }

    fn is_in_flight(&self, partition: &TopicPartition) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .contains(partition)
    }

    fn in_flight_partitions(&self) -> HashSet<TopicPartition> {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .clone()
    }

    fn is_paused(&self, partition: &TopicPartition) -> bool {
        self.paused
            .lock()
            .expect("pause lock poisoned")
            .contains(partition)
    }
}

// -----------------------------------------------------------------------------
// Batches
// -----------------------------------------------------------------------------

/// Marks a partition busy until dropped, even if the batch outlives its
/// session or panics.
struct InFlight {
    partitions: Arc<Mutex<HashSet<TopicPartition>>>,
    partition: TopicPartition,
}

impl InFlight {
    fn register(partitions: &Arc<Mutex<HashSet<TopicPartition>>>, partition: TopicPartition) -> Self {
        partitions
            .lock()
            .expect("in-flight lock poisoned")
            .insert(partition.clone());
        Self {
            partitions: Arc::clone(partitions),
            partition,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut partitions) = self.partitions.lock() {
            partitions.remove(&self.partition);
        }
    }
}

/// Delivers one fetched batch of a partition, in offset order.
struct BatchTask {
    partition: TopicPartition,
    dispatch: Arc<dyn Dispatch>,
    offsets: Arc<Mutex<CommitCoordinator>>,
    revoked: Arc<AtomicBool>,
    commit_mode: CommitMode,
}

impl BatchTask {
    async fn run(self, records: Vec<ConsumedRecord>) -> BatchResult {
        for record in records {
            let offset = record.offset;
            if !self.update(|offsets| offsets.record_delivered(&self.partition, offset)) {
                break;
            }

            match self.dispatch.dispatch(record).await {
                Outcome::Handled => {}
                Outcome::Undecodable(err) => {
                    warn!(partition = %self.partition, offset = %offset, error = %err, "Skipping undecodable record");
                }
                Outcome::HandlerFailed(err) => match self.commit_mode {
                    CommitMode::AutoInterval(_) => {
                        warn!(partition = %self.partition, offset = %offset, error = %err, "Handler failed, skipping record");
                    }
                    CommitMode::ManualAfterSuccess => {
                        warn!(partition = %self.partition, offset = %offset, error = %err, "Handler failed, record will be redelivered");
                        return BatchResult {
                            partition: self.partition,
                            failed: Some(offset),
                        };
                    }
                },
            }

            if !self.update(|offsets| offsets.acknowledge(&self.partition, offset)) {
                break;
            }
        }

        BatchResult {
            partition: self.partition,
            failed: None,
        }
    }

    /// Applies `f` unless the session ended; false once revoked.
    fn update(&self, f: impl FnOnce(&mut CommitCoordinator)) -> bool {
        let mut offsets = self.offsets.lock().expect("offsets lock poisoned");
        if self.revoked.load(Ordering::Acquire) {
            return false;
        }
        f(&mut offsets);
        true
    }
}

fn stalled(err: RetryError) -> ClientError {
    if err.source.is_retryable() {
        ClientError::ConsumptionStalled {
            attempts: err.attempts,
            source: err.source,
        }
    } else {
        ClientError::Broker(err.source)
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|requested| *requested).await;
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
