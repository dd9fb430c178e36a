//! Herald Core - Strongly-typed identifiers, records and limits for Herald.
//!
//! This crate holds the vocabulary shared by the broker boundary and the
//! producer/consumer clients. It does NOT talk to a broker; transport is
//! the job of a `Broker` implementation in `herald-broker`.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: Prevent mixing up a `MemberId` with a `PartitionId`
//! - **Explicit limits**: Every queue and payload has a bounded maximum
//! - **Immutable records**: A produced `Record` cannot change after construction
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod limits;
mod record;
mod types;

pub use error::{BrokerErrorKind, Error, Result};
pub use limits::Limits;
pub use record::{ConsumedRecord, Header, Offset, Record, RecordError, Timestamp};
pub use types::{BatchId, GenerationId, MemberId, PartitionId, TopicPartition};
