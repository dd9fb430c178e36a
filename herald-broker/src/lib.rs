//! Broker boundary for Herald.
//!
//! The producer and consumer clients in `herald-client` only ever talk to
//! a [`Broker`]. This crate defines that trait together with the consumer
//! group protocol behind it, and ships [`SimulatedBroker`], an in-memory
//! implementation used by the tests and the demo binary.
//!
//! # Consumer Groups
//!
//! Group membership is generation based. Every membership change (join,
//! leave, session expiry, subscription change) starts a rebalance: members
//! learn about it from their heartbeat, give up their partitions, commit,
//! and rejoin. Assignments are computed by a [`PartitionAssignor`] once all
//! live members have rejoined, so a partition never has two owners within
//! a generation.
//!
//! # Example
//!
//! ```ignore
//! use herald_broker::{Acks, Broker, SimulatedBroker};
//! use herald_core::{Offset, PartitionId, Record, TopicPartition};
//!
//! let broker = SimulatedBroker::new(42);
//! broker.create_topic("orders", 3)?;
//!
//! let tp = TopicPartition::new("orders", PartitionId::new(0));
//! broker.append(&tp, vec![Record::new("orders", "hello")], Acks::Leader).await?;
//! let response = broker.fetch(&tp, Offset::new(0), 100).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod assignor;
mod broker;
mod error;
mod group;
mod log;
mod simulated;

pub use assignor::{
    AssignmentStrategy, MemberAssignments, PartitionAssignor, RangeAssignor, RoundRobinAssignor,
    Subscriptions,
};
pub use broker::{
    Acks, Assignment, Broker, FetchResponse, HeartbeatOutcome, JoinGroupRequest, JoinOutcome,
    LogBounds,
};
pub use error::{BrokerError, BrokerResult};
pub use group::{GroupCoordinator, GroupPhase, GroupSnapshot};
pub use log::PartitionLog;
pub use simulated::{BrokerFaultConfig, SimulatedBroker, SimulatedBrokerConfig};
