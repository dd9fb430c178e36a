//! Client limits and configuration bounds.
//!
//! Put limits on everything: every queue, buffer and payload has an
//! explicit maximum size.

/// Limits shared by the producer and consumer clients.
///
/// Default values are safe for most deployments while allowing customization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Record limits.
    /// Maximum encoded size of a single record in bytes.
    pub max_record_bytes: u32,
    /// Maximum size of a record key in bytes.
    pub max_key_bytes: u32,
    /// Maximum number of headers on a record.
    pub max_headers_per_record: u32,

    // Producer limits.
    /// Maximum size of a producer batch in bytes.
    pub max_batch_bytes: u32,
    /// Maximum number of records in a producer batch.
    pub max_batch_records: u32,
    /// Maximum number of records waiting in the producer's queue.
    pub max_in_flight_records: u32,

    // Consumer limits.
    /// Maximum number of records returned by a single fetch.
    pub max_poll_records: u32,
    /// Maximum number of handler workers per consumer instance.
    pub max_workers: u32,
    /// Maximum number of members in a consumer group.
    pub max_members_per_group: u32,

    // Retry and timing limits.
    /// Maximum retry attempts for a transient broker failure.
    pub max_retry_attempts: u32,
    /// Minimum session timeout in microseconds.
    pub min_session_timeout_us: u64,
    /// Maximum session timeout in microseconds.
    pub max_session_timeout_us: u64,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Records: 1MB record, 64KB key, 64 headers.
            max_record_bytes: 1024 * 1024,
            max_key_bytes: 64 * 1024,
            max_headers_per_record: 64,

            // Producer: 16MB batch, 10k records/batch, 100k queued.
            max_batch_bytes: 16 * 1024 * 1024,
            max_batch_records: 10_000,
            max_in_flight_records: 100_000,

            // Consumer: 10k records/poll, 256 workers, 1000 members.
            max_poll_records: 10_000,
            max_workers: 256,
            max_members_per_group: 1000,

            // Retries: 100 attempts, session timeout in [1ms, 30min].
            max_retry_attempts: 100,
            min_session_timeout_us: 1000,
            max_session_timeout_us: 30 * 60 * 1_000_000,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_record_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_record_bytes",
                reason: "must be positive",
            });
        }

        // A batch must be able to hold at least one record.
        if self.max_batch_bytes < self.max_record_bytes {
            return Err(crate::Error::InvalidArgument {
                name: "max_batch_bytes",
                reason: "must be >= max_record_bytes",
            });
        }

        if self.max_key_bytes > self.max_record_bytes {
            return Err(crate::Error::InvalidArgument {
                name: "max_key_bytes",
                reason: "must be <= max_record_bytes",
            });
        }

        if self.max_batch_records == 0 || self.max_poll_records == 0 || self.max_workers == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_batch_records",
                reason: "batch, poll and worker limits must be positive",
            });
        }

        if self.max_session_timeout_us < self.min_session_timeout_us {
            return Err(crate::Error::InvalidArgument {
                name: "max_session_timeout_us",
                reason: "must be >= min_session_timeout_us",
            });
        }

        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        let limits = Limits::new();
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_invalid_record_size() {
        let mut limits = Limits::new();
        limits.max_record_bytes = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_batch_smaller_than_record() {
        let mut limits = Limits::new();
        limits.max_batch_bytes = 512;
        limits.max_record_bytes = 1024;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_session_timeout_range() {
        let mut limits = Limits::new();
        limits.min_session_timeout_us = 10_000;
        limits.max_session_timeout_us = 5_000;
        assert!(limits.validate().is_err());
    }
}
