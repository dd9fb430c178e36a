//! Strongly-typed identifiers for Herald entities.
//!
//! Explicit types prevent bugs from mixing up IDs. Numeric IDs are 64-bit;
//! topics are addressed by name because that is what client code configures.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `MemberId` with `PartitionId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(PartitionId, "partition", "Index of a partition within a topic.");

// Consumer group membership.
define_id!(MemberId, "member", "Identifier the group coordinator assigns to a consumer instance.");
define_id!(GenerationId, "gen", "Group generation; bumped on every membership change.");

// Producer batching.
define_id!(BatchId, "batch", "Sequence number of a batch flushed by a producer.");

/// A partition of a named topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition within the topic.
    pub partition: PartitionId,
}

impl TopicPartition {
    /// Creates a new topic partition.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let member = MemberId::new(1);
        let partition = PartitionId::new(1);

        // Different types even with the same value.
        assert_eq!(member.get(), partition.get());
    }

    #[test]
    fn test_id_display() {
        let member = MemberId::new(42);
        assert_eq!(format!("{member}"), "member-42");
        assert_eq!(format!("{member:?}"), "member(42)");
    }

    #[test]
    fn test_id_next() {
        let generation = GenerationId::new(0);
        assert_eq!(generation.next().get(), 1);
        assert_eq!(generation.next().next().get(), 2);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let id = BatchId::new(u64::MAX);
        let _ = id.next();
    }

    #[test]
    fn test_topic_partition_ordering() {
        let a = TopicPartition::new("a", PartitionId::new(1));
        let b = TopicPartition::new("a", PartitionId::new(2));
        let c = TopicPartition::new("b", PartitionId::new(0));

        assert!(a < b);
        assert!(b < c);
        assert_eq!(format!("{a}"), "a/1");
    }
}
