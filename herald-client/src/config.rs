//! Client configuration.
//!
//! Configs are plain structs with safe defaults, a `for_testing()`
//! constructor with short timings, and `with_*` builders. Clients call
//! `validate()` at construction and refuse to start on invalid settings.

use std::time::Duration;

use herald_broker::Acks;
use herald_core::Limits;

use crate::error::{ClientError, ClientResult};
use crate::retry::RetryPolicy;

/// Default bootstrap address.
pub const DEFAULT_BOOTSTRAP_SERVER: &str = "localhost:9092";

fn validate_bootstrap_servers(servers: &[String]) -> ClientResult<()> {
    if servers.is_empty() {
        return Err(ClientError::configuration(
            "bootstrap_servers",
            "at least one server is required",
        ));
    }
    if let Some(bad) = servers
        .iter()
        .find(|s| s.is_empty() || !s.contains(':'))
    {
        return Err(ClientError::configuration(
            "bootstrap_servers",
            format!("'{bad}' is not a host:port pair"),
        ));
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// Producer
// -----------------------------------------------------------------------------

/// How keyless records are spread over partitions.
///
/// Keyed records are always partitioned by a hash of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Partitioner {
    /// Cycle through partitions record by record.
    #[default]
    RoundRobin,
    /// Stick to one partition until its batch is flushed.
    Sticky,
}

/// Configuration for a [`Producer`](crate::Producer).
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Broker addresses used to bootstrap the connection.
    pub bootstrap_servers: Vec<String>,
    /// Acknowledgment level.
    pub acks: Acks,
    /// Partitioner for keyless records.
    pub partitioner: Partitioner,
    /// Flush a partition batch once it holds this many records.
    pub batch_max_records: u32,
    /// Flush a partition batch once it holds this many bytes.
    pub batch_max_bytes: u32,
    /// Flush a partition batch once its oldest record waited this long.
    pub linger: Duration,
    /// Maximum records sent but not yet resolved.
    pub buffer_capacity: u32,
    /// Retry policy for appends and metadata requests.
    pub retry: RetryPolicy,
    /// Record and batch limits.
    pub limits: Limits,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec![DEFAULT_BOOTSTRAP_SERVER.to_string()],
            acks: Acks::Leader,
            partitioner: Partitioner::RoundRobin,
            batch_max_records: 1000,
            batch_max_bytes: 1024 * 1024,
            linger: Duration::from_millis(5),
            buffer_capacity: 10_000,
            retry: RetryPolicy::default(),
            limits: Limits::default(),
        }
    }
}

impl ProducerConfig {
    /// Creates a config for testing: small batches, short linger, fast retries.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            batch_max_records: 16,
            linger: Duration::from_millis(1),
            buffer_capacity: 1000,
            retry: RetryPolicy::for_testing(),
            ..Self::default()
        }
    }

    /// Sets the bootstrap servers.
    #[must_use]
    pub fn with_bootstrap_servers(mut self, servers: Vec<String>) -> Self {
        self.bootstrap_servers = servers;
        self
    }

    /// Sets the acknowledgment level.
    #[must_use]
    pub const fn with_acks(mut self, acks: Acks) -> Self {
        self.acks = acks;
        self
    }

    /// Sets the partitioner for keyless records.
    #[must_use]
    pub const fn with_partitioner(mut self, partitioner: Partitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Sets the batch thresholds.
    #[must_use]
    pub const fn with_batching(mut self, max_records: u32, max_bytes: u32, linger: Duration) -> Self {
        self.batch_max_records = max_records;
        self.batch_max_bytes = max_bytes;
        self.linger = linger;
        self
    }

    /// Sets the in-flight buffer capacity.
    #[must_use]
    pub const fn with_buffer_capacity(mut self, capacity: u32) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `Configuration` naming the first invalid setting.
    pub fn validate(&self) -> ClientResult<()> {
        self.limits.validate()?;
        validate_bootstrap_servers(&self.bootstrap_servers)?;
        self.retry.validate(&self.limits)?;

        if self.batch_max_records == 0 || self.batch_max_records > self.limits.max_batch_records {
            return Err(ClientError::configuration(
                "batch_max_records",
                format!("must be in 1..={}", self.limits.max_batch_records),
            ));
        }
        if self.batch_max_bytes < self.limits.max_record_bytes.min(self.limits.max_batch_bytes)
            || self.batch_max_bytes > self.limits.max_batch_bytes
        {
            return Err(ClientError::configuration(
                "batch_max_bytes",
                format!(
                    "must hold one maximum-size record and not exceed {}",
                    self.limits.max_batch_bytes
                ),
            ));
        }
        if self.buffer_capacity == 0 || self.buffer_capacity > self.limits.max_in_flight_records {
            return Err(ClientError::configuration(
                "buffer_capacity",
                format!("must be in 1..={}", self.limits.max_in_flight_records),
            ));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Consumer
// -----------------------------------------------------------------------------

/// Where to start when a partition has no usable committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    /// Start from the earliest retained record.
    #[default]
    Earliest,
    /// Start from the log end (only new records).
    Latest,
}

/// When the consumer commits offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Commit everything delivered to the handler on a fixed interval,
    /// whatever the handler's outcome.
    AutoInterval(Duration),
    /// Commit only offsets the handler acknowledged, after each batch.
    ManualAfterSuccess,
}

impl Default for CommitMode {
    fn default() -> Self {
        Self::AutoInterval(Duration::from_secs(5))
    }
}

/// Configuration for a [`Consumer`](crate::Consumer).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Broker addresses used to bootstrap the connection.
    pub bootstrap_servers: Vec<String>,
    /// Reset policy for partitions without a committed offset.
    pub offset_reset: OffsetReset,
    /// Commit policy.
    pub commit_mode: CommitMode,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Session timeout; the coordinator evicts members silent for longer.
    pub session_timeout: Duration,
    /// Maximum records fetched from one partition per poll.
    pub max_poll_records: u32,
    /// Maximum concurrent handler batches.
    pub worker_count: u32,
    /// Pause between polls when nothing was fetched.
    pub poll_interval: Duration,
    /// How long in-flight handlers are awaited on rebalance and close.
    pub shutdown_grace: Duration,
    /// How long a partition is paused after a handler failure in manual mode.
    pub handler_retry_backoff: Duration,
    /// Retry policy for broker requests.
    pub retry: RetryPolicy,
    /// Limits.
    pub limits: Limits,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec![DEFAULT_BOOTSTRAP_SERVER.to_string()],
            offset_reset: OffsetReset::Earliest,
            commit_mode: CommitMode::default(),
            heartbeat_interval: Duration::from_secs(3),
            session_timeout: Duration::from_secs(45),
            max_poll_records: 500,
            worker_count: 4,
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(30),
            handler_retry_backoff: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            limits: Limits::default(),
        }
    }
}

impl ConsumerConfig {
    /// Creates a config for testing with millisecond timings.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            commit_mode: CommitMode::AutoInterval(Duration::from_millis(20)),
            heartbeat_interval: Duration::from_millis(10),
            session_timeout: Duration::from_millis(500),
            max_poll_records: 64,
            poll_interval: Duration::from_millis(2),
            shutdown_grace: Duration::from_millis(200),
            handler_retry_backoff: Duration::from_millis(5),
            retry: RetryPolicy::for_testing(),
            ..Self::default()
        }
    }

    /// Sets the bootstrap servers.
    #[must_use]
    pub fn with_bootstrap_servers(mut self, servers: Vec<String>) -> Self {
        self.bootstrap_servers = servers;
        self
    }

    /// Sets the offset reset policy.
    #[must_use]
    pub const fn with_offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.offset_reset = offset_reset;
        self
    }

    /// Sets the commit policy.
    #[must_use]
    pub const fn with_commit_mode(mut self, commit_mode: CommitMode) -> Self {
        self.commit_mode = commit_mode;
        self
    }

    /// Sets the number of concurrent handler batches.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: u32) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Sets the maximum records per poll.
    #[must_use]
    pub const fn with_max_poll_records(mut self, max_poll_records: u32) -> Self {
        self.max_poll_records = max_poll_records;
        self
    }

    /// Sets heartbeat interval and session timeout.
    #[must_use]
    pub const fn with_session(mut self, heartbeat_interval: Duration, session_timeout: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self.session_timeout = session_timeout;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the session timeout in microseconds.
    #[must_use]
    pub fn session_timeout_us(&self) -> u64 {
        u64::try_from(self.session_timeout.as_micros()).unwrap_or(u64::MAX)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `Configuration` naming the first invalid setting.
    pub fn validate(&self) -> ClientResult<()> {
        self.limits.validate()?;
        validate_bootstrap_servers(&self.bootstrap_servers)?;
        self.retry.validate(&self.limits)?;

        if let CommitMode::AutoInterval(interval) = self.commit_mode {
            if interval.is_zero() {
                return Err(ClientError::configuration(
                    "commit_mode",
                    "auto-commit interval must be positive",
                ));
            }
        }

        let session_us = self.session_timeout_us();
        if session_us < self.limits.min_session_timeout_us
            || session_us > self.limits.max_session_timeout_us
        {
            return Err(ClientError::configuration(
                "session_timeout",
                format!(
                    "must be within [{}us, {}us]",
                    self.limits.min_session_timeout_us, self.limits.max_session_timeout_us
                ),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.session_timeout {
            return Err(ClientError::configuration(
                "heartbeat_interval",
                "must be positive and shorter than session_timeout",
            ));
        }
        // No heartbeats are sent while a session drains.
        if self.shutdown_grace >= self.session_timeout {
            return Err(ClientError::configuration(
                "shutdown_grace",
                "must be shorter than session_timeout",
            ));
        }
        if self.max_poll_records == 0 || self.max_poll_records > self.limits.max_poll_records {
            return Err(ClientError::configuration(
                "max_poll_records",
                format!("must be in 1..={}", self.limits.max_poll_records),
            ));
        }
        if self.worker_count == 0 || self.worker_count > self.limits.max_workers {
            return Err(ClientError::configuration(
                "worker_count",
                format!("must be in 1..={}", self.limits.max_workers),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ClientError::configuration(
                "poll_interval",
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ProducerConfig::default().validate().is_ok());
        assert!(ProducerConfig::for_testing().validate().is_ok());
        assert!(ConsumerConfig::default().validate().is_ok());
        assert!(ConsumerConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_bootstrap_servers() {
        let err = ProducerConfig::default()
            .with_bootstrap_servers(vec![])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ClientError::Configuration { name: "bootstrap_servers", .. }));

        let err = ConsumerConfig::default()
            .with_bootstrap_servers(vec!["no-port".into()])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("no-port"));
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_session() {
        let err = ConsumerConfig::default()
            .with_session(Duration::from_secs(10), Duration::from_secs(5))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ClientError::Configuration { name: "heartbeat_interval", .. }));
    }

    #[test]
    fn test_shutdown_grace_must_be_shorter_than_session() {
        let config = ConsumerConfig::default()
            .with_session(Duration::from_secs(1), Duration::from_secs(10))
            .with_shutdown_grace(Duration::from_secs(10));
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ClientError::Configuration { name: "shutdown_grace", .. }));
        assert!(config
            .with_shutdown_grace(Duration::from_secs(9))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_worker_count_bounds() {
        assert!(ConsumerConfig::default().with_worker_count(0).validate().is_err());
        assert!(ConsumerConfig::default().with_worker_count(10_000).validate().is_err());
    }

    #[test]
    fn test_zero_auto_commit_interval() {
        let config = ConsumerConfig::default()
            .with_commit_mode(CommitMode::AutoInterval(Duration::ZERO));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batch_bounds() {
        let config = ProducerConfig::default().with_batching(0, 1024 * 1024, Duration::ZERO);
        assert!(config.validate().is_err());
        let config = ProducerConfig::default().with_batching(10, 16, Duration::ZERO);
        assert!(config.validate().is_err());
        assert!(ProducerConfig::default().with_buffer_capacity(0).validate().is_err());
    }
}
