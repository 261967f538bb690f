//! Envelope definitions
//!
//! An [`Envelope`] is the unit exchanged between peers: an application-chosen
//! type tag plus an opaque [`Payload`].

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::CodecError;

/// Type tag reserved for the local notification dispatched when a connection ends.
pub const DISCONNECT_MESSAGE_TYPE: &str = "disconnect";

/// Opaque message body
///
/// The bus never looks inside a payload. Applications usually fill it with
/// [`Payload::encode`] and read it back with [`Payload::decode`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(Bytes);

impl Payload {
    /// Serialize a value into a payload
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Ok(Self(Bytes::from(bincode::serialize(value)?)))
    }

    /// Deserialize the payload into a value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(bincode::deserialize(&self.0)?)
    }

    /// Wrap raw bytes without any serialization
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A typed message: type tag plus payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    message_type: String,
    payload: Payload,
}

impl Envelope {
    /// Build an envelope. The type tag must not be empty.
    pub fn new(message_type: impl Into<String>, payload: Payload) -> Result<Self, CodecError> {
        let message_type = message_type.into();
        if message_type.is_empty() {
            return Err(CodecError::EmptyMessageType);
        }
        Ok(Self {
            message_type,
            payload,
        })
    }

    /// Build an envelope whose payload is the serialized `value`
    pub fn with_value<T: Serialize + ?Sized>(
        message_type: impl Into<String>,
        value: &T,
    ) -> Result<Self, CodecError> {
        Self::new(message_type, Payload::encode(value)?)
    }

    /// Local notification carrying the reason a connection ended
    pub(crate) fn disconnect(reason: &str) -> Result<Self, CodecError> {
        Self::with_value(DISCONNECT_MESSAGE_TYPE, reason)
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_parts(self) -> (String, Payload) {
        (self.message_type, self.payload)
    }
}
