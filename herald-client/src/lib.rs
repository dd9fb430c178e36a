//! Herald Client - Producer and consumer clients with at-least-once delivery.
//!
//! Both clients talk to a broker only through the [`herald_broker::Broker`]
//! trait and receive their settings as plain config structs.
//!
//! # Producing
//!
//! [`Producer::send`] never blocks. It returns a [`DeliveryHandle`] that
//! resolves once the broker has confirmed the record (or delivery failed
//! for good). Records are batched per partition in a background task.
//!
//! # Consuming
//!
//! A [`Consumer`] joins a consumer group, receives its share of the
//! subscribed partitions and hands records to a [`MessageHandler`]. Offsets
//! are tracked by a [`CommitCoordinator`] and committed according to the
//! configured [`CommitMode`]:
//!
//! - `AutoInterval`: the delivered position is committed on a timer
//! - `ManualAfterSuccess`: only records whose handler succeeded, in order
//!
//! Committed offsets never move backwards and never pass a record that was
//! not delivered to the handler.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use herald_broker::SimulatedBroker;
//! use herald_client::{Consumer, ConsumerConfig, Message, Producer, ProducerConfig, StringCodec};
//! use herald_core::Record;
//!
//! let broker = Arc::new(SimulatedBroker::new(42));
//!
//! let producer = Producer::new(Arc::clone(&broker), ProducerConfig::default())?;
//! producer.send(Record::new("orders", "hello")).await?;
//!
//! let consumer = Consumer::new(broker, ConsumerConfig::default())?;
//! consumer.subscribe(["orders"], "billing", StringCodec, |message: Message<String>| async move {
//!     println!("{}", message.value);
//!     Ok(())
//! })?;
//! consumer.run().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod codec;
mod commit;
mod config;
mod consumer;
mod dispatch;
mod error;
mod producer;
mod retry;

pub use codec::{BytesCodec, Deserializer, JsonCodec, Serializer, StringCodec};
pub use commit::{CommitCoordinator, PartitionOffsets};
pub use config::{
    CommitMode, ConsumerConfig, OffsetReset, Partitioner, ProducerConfig,
    DEFAULT_BOOTSTRAP_SERVER,
};
pub use consumer::{Consumer, ConsumerState};
pub use dispatch::{HandlerError, Message, MessageHandler};
pub use error::{
    ClientError, ClientResult, CodecError, CodecResult, CommitError, ErrorCategory,
};
pub use producer::{DeliveryHandle, DeliveryReport, DeliveryStatus, Producer};
pub use retry::{RetryError, RetryPolicy};
