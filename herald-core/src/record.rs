//! Record types for Herald.
//!
//! A [`Record`] is what a producer hands to the client: topic, optional key,
//! value, optional timestamp and headers. It is immutable once constructed;
//! builder methods consume and return it.
//!
//! A [`ConsumedRecord`] is what the broker returns on fetch: the same data
//! plus the partition and offset the broker assigned.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::limits::Limits;
use crate::types::{PartitionId, TopicPartition};

/// A record header (key-value metadata).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header key.
    pub key: Bytes,
    /// Header value.
    pub value: Bytes,
}

impl Header {
    /// Creates a new header.
    #[must_use]
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns the encoded size of this header.
    #[must_use]
    pub const fn encoded_size(&self) -> usize {
        4 + self.key.len() + 4 + self.value.len()
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since Unix epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since Unix epoch.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns the current time as a timestamp.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Timestamps won't overflow i64 for centuries.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }
}

/// Position of a record in a partition log.
///
/// When used as a committed offset it means "the next record to consume".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    /// Creates an offset from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw offset value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next offset.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the offset `count` positions after this one.
    #[must_use]
    pub const fn advance(self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An outbound record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    topic: String,
    key: Option<Bytes>,
    value: Bytes,
    timestamp: Option<Timestamp>,
    headers: Vec<Header>,
}

impl Record {
    /// Creates a new record with just a value.
    #[must_use]
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
            timestamp: None,
            headers: Vec::new(),
        }
    }

    /// Creates a new record with key and value.
    #[must_use]
    pub fn with_key(
        topic: impl Into<String>,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(topic, value)
        }
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the key, if any.
    #[must_use]
    pub const fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    /// Returns the value.
    #[must_use]
    pub const fn value(&self) -> &Bytes {
        &self.value
    }

    /// Returns the client-supplied timestamp, if any.
    #[must_use]
    pub const fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// Returns the headers.
    #[must_use]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Returns the approximate size of the record in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        let key_size = self.key.as_ref().map_or(0, Bytes::len);
        let headers_size: usize = self.headers.iter().map(Header::encoded_size).sum();
        8 + 4 + key_size + 4 + self.value.len() + 4 + headers_size
    }

    /// Validates the record against limits.
    ///
    /// # Errors
    /// Returns an error if the topic is empty or the record exceeds any limit.
    pub fn validate(&self, limits: &Limits) -> Result<(), RecordError> {
        if self.topic.is_empty() {
            return Err(RecordError::EmptyTopic);
        }

        let size = self.size();
        if size > limits.max_record_bytes as usize {
            return Err(RecordError::TooLarge {
                size,
                max: limits.max_record_bytes as usize,
            });
        }

        if let Some(ref key) = self.key {
            if key.len() > limits.max_key_bytes as usize {
                return Err(RecordError::KeyTooLarge {
                    size: key.len(),
                    max: limits.max_key_bytes as usize,
                });
            }
        }

        if self.headers.len() > limits.max_headers_per_record as usize {
            return Err(RecordError::TooManyHeaders {
                count: self.headers.len(),
                max: limits.max_headers_per_record as usize,
            });
        }

        Ok(())
    }
}

/// A record as returned by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    /// Topic name.
    pub topic: String,
    /// Partition the record was read from.
    pub partition: PartitionId,
    /// Offset assigned by the broker.
    pub offset: Offset,
    /// Optional key.
    pub key: Option<Bytes>,
    /// The record value.
    pub value: Bytes,
    /// Client timestamp, or broker append time if the client sent none.
    pub timestamp: Timestamp,
    /// Headers.
    pub headers: Vec<Header>,
}

impl ConsumedRecord {
    /// Builds the stored form of a produced record.
    #[must_use]
    pub fn from_record(
        record: Record,
        partition: PartitionId,
        offset: Offset,
        append_time: Timestamp,
    ) -> Self {
        Self {
            topic: record.topic,
            partition,
            offset,
            key: record.key,
            value: record.value,
            timestamp: record.timestamp.unwrap_or(append_time),
            headers: record.headers,
        }
    }

    /// Returns the topic partition this record belongs to.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Record-related errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Topic name is empty.
    EmptyTopic,
    /// Record exceeds the maximum size.
    TooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
    /// Record key exceeds maximum size.
    KeyTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
    /// Too many headers on a record.
    TooManyHeaders {
        /// Actual count.
        count: usize,
        /// Maximum allowed count.
        max: usize,
    },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTopic => write!(f, "record topic is empty"),
            Self::TooLarge { size, max } => {
                write!(f, "record too large: {size} > {max}")
            }
            Self::KeyTooLarge { size, max } => {
                write!(f, "record key too large: {size} > {max}")
            }
            Self::TooManyHeaders { count, max } => {
                write!(f, "too many headers: {count} > {max}")
            }
        }
    }
}

impl std::error::Error for RecordError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_new() {
        let record = Record::new("t", "hello");
        assert_eq!(record.topic(), "t");
        assert!(record.key().is_none());
        assert_eq!(record.value(), &Bytes::from("hello"));
        assert!(record.timestamp().is_none());
        assert!(record.headers().is_empty());
    }

    #[test]
    fn test_record_with_key() {
        let record = Record::with_key("t", "user-123", "data");
        assert_eq!(record.key(), Some(&Bytes::from("user-123")));
        assert_eq!(record.value(), &Bytes::from("data"));
    }

    #[test]
    fn test_record_with_headers() {
        let record = Record::new("t", "value")
            .with_header("content-type", "text/plain")
            .with_header("trace-id", "abc123");
        assert_eq!(record.headers().len(), 2);
    }

    #[test]
    fn test_validate_empty_topic() {
        let record = Record::new("", "value");
        assert_eq!(
            record.validate(&Limits::default()),
            Err(RecordError::EmptyTopic)
        );
    }

    #[test]
    fn test_validate_too_large() {
        let limits = Limits {
            max_record_bytes: 64,
            ..Limits::default()
        };
        let record = Record::new("t", vec![0u8; 128]);
        assert!(matches!(
            record.validate(&limits),
            Err(RecordError::TooLarge { max: 64, .. })
        ));
    }

    #[test]
    fn test_validate_key_too_large() {
        let limits = Limits {
            max_key_bytes: 4,
            ..Limits::default()
        };
        let record = Record::with_key("t", "long-key", "v");
        assert!(matches!(
            record.validate(&limits),
            Err(RecordError::KeyTooLarge { size: 8, max: 4 })
        ));
    }

    #[test]
    fn test_consumed_record_keeps_client_timestamp() {
        let record = Record::new("t", "v").with_timestamp(Timestamp::from_millis(10));
        let consumed = ConsumedRecord::from_record(
            record,
            PartitionId::new(2),
            Offset::new(7),
            Timestamp::from_millis(99),
        );
        assert_eq!(consumed.timestamp, Timestamp::from_millis(10));
        assert_eq!(consumed.offset, Offset::new(7));
        assert_eq!(
            consumed.topic_partition(),
            TopicPartition::new("t", PartitionId::new(2))
        );
    }

    #[test]
    fn test_consumed_record_falls_back_to_append_time() {
        let consumed = ConsumedRecord::from_record(
            Record::new("t", "v"),
            PartitionId::new(0),
            Offset::new(0),
            Timestamp::from_millis(99),
        );
        assert_eq!(consumed.timestamp, Timestamp::from_millis(99));
    }

    #[test]
    fn test_offset() {
        let offset = Offset::new(42);
        assert_eq!(offset.get(), 42);
        assert_eq!(offset.next().get(), 43);
        assert_eq!(offset.advance(8).get(), 50);
        assert_eq!(format!("{offset}"), "42");
    }
}
