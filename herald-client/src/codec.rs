//! Key and value codecs.
//!
//! Producers turn typed keys and values into bytes with a [`Serializer`];
//! consumers turn record values back into typed messages with a
//! [`Deserializer`].

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CodecError, CodecResult};

/// Encodes values of type `T`.
pub trait Serializer<T: ?Sized>: Send + Sync {
    /// Serializes a value.
    ///
    /// # Errors
    /// Returns an error if the value cannot be encoded.
    fn serialize(&self, value: &T) -> CodecResult<Bytes>;
}

/// Decodes record values.
pub trait Deserializer: Send + Sync + 'static {
    /// The decoded type.
    type Output: Send + 'static;

    /// Deserializes a value.
    ///
    /// # Errors
    /// Returns an error if the bytes cannot be decoded.
    fn deserialize(&self, bytes: &Bytes) -> CodecResult<Self::Output>;
}

/// UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Serializer<str> for StringCodec {
    fn serialize(&self, value: &str) -> CodecResult<Bytes> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl Serializer<String> for StringCodec {
    fn serialize(&self, value: &String) -> CodecResult<Bytes> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl Deserializer for StringCodec {
    type Output = String;

    fn deserialize(&self, bytes: &Bytes) -> CodecResult<String> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| CodecError::InvalidUtf8 {
                reason: e.to_string(),
            })
    }
}

/// Raw bytes, passed through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Serializer<[u8]> for BytesCodec {
    fn serialize(&self, value: &[u8]) -> CodecResult<Bytes> {
        Ok(Bytes::copy_from_slice(value))
    }
}

impl Serializer<Bytes> for BytesCodec {
    fn serialize(&self, value: &Bytes) -> CodecResult<Bytes> {
        Ok(value.clone())
    }
}

impl Deserializer for BytesCodec {
    type Output = Bytes;

    fn deserialize(&self, bytes: &Bytes) -> CodecResult<Bytes> {
        Ok(bytes.clone())
    }
}

/// JSON via serde.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Creates a JSON codec for `T`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T: Serialize> Serializer<T> for JsonCodec<T> {
    fn serialize(&self, value: &T) -> CodecResult<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Json {
                reason: e.to_string(),
            })
    }
}

impl<T: DeserializeOwned + Send + 'static> Deserializer for JsonCodec<T> {
    type Output = T;

    fn deserialize(&self, bytes: &Bytes) -> CodecResult<T> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Json {
            reason: e.to_string(),
        })
    }
}
