//! Message handlers and record dispatch.
//!
//! A consumer owns one type-erased [`Dispatch`] built from the deserializer
//! and handler passed to `subscribe`. Dispatch decodes a record, calls the
//! handler, and reports the outcome without ever unwinding into the poll
//! loop: handler panics are caught and turned into handler failures.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use herald_core::{ConsumedRecord, Header, Offset, PartitionId, Timestamp, TopicPartition};
use thiserror::Error;

use crate::codec::Deserializer;
use crate::error::CodecError;

/// A decoded record handed to a [`MessageHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<V> {
    /// Topic name.
    pub topic: String,
    /// Partition the record was read from.
    pub partition: PartitionId,
    /// Offset of the record.
    pub offset: Offset,
    /// Raw key, if any.
    pub key: Option<Bytes>,
    /// Decoded value.
    pub value: V,
    /// Record timestamp.
    pub timestamp: Timestamp,
    /// Headers.
    pub headers: Vec<Header>,
}

impl<V> Message<V> {
    /// Returns the topic partition this message came from.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Failure reported by a message handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Processes decoded messages.
///
/// Any `Fn(Message<V>) -> impl Future<Output = Result<(), HandlerError>>`
/// closure is a handler.
#[async_trait]
pub trait MessageHandler<V>: Send + Sync + 'static {
    /// Handles one message. Returning an error marks the record as failed.
    async fn handle(&self, message: Message<V>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<V, F, Fut> MessageHandler<V> for F
where
    V: Send + 'static,
    F: Fn(Message<V>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message<V>) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Outcome of dispatching one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The handler returned `Ok`.
    Handled,
    /// The handler returned an error or panicked.
    HandlerFailed(HandlerError),
    /// The value could not be decoded.
    Undecodable(CodecError),
}

/// Type-erased decode-and-handle step.
#[async_trait]
pub(crate) trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, record: ConsumedRecord) -> Outcome;
}

pub(crate) struct TypedDispatch<D, H> {
    deserializer: D,
    handler: H,
}

impl<D, H> TypedDispatch<D, H> {
    pub(crate) const fn new(deserializer: D, handler: H) -> Self {
        Self {
            deserializer,
            handler,
        }
    }
}

#[async_trait]
impl<D, H> Dispatch for TypedDispatch<D, H>
where
    D: Deserializer,
    H: MessageHandler<D::Output>,
{
    async fn dispatch(&self, record: ConsumedRecord) -> Outcome {
        let value = match self.deserializer.deserialize(&record.value) {
            Ok(value) => value,
            Err(err) => return Outcome::Undecodable(err),
        };

        let message = Message {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            key: record.key,
            value,
            timestamp: record.timestamp,
            headers: record.headers,
        };

        match AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Outcome::Handled,
            Ok(Err(err)) => Outcome::HandlerFailed(err),
            Err(panic) => Outcome::HandlerFailed(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        return message;
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.as_str();
    }
    "non-string panic payload"
}
