//! Wire message model: typed payloads, messages, and signed envelopes.
//!
//! Everything on the wire is CBOR. An [`Envelope`] carries a [`Message`] and a
//! detached signature over the message's CBOR bytes. Payloads are
//! self-describing (`type_url` + bytes) so a handler only decodes types it
//! recognizes.

use std::fmt;

use courier_keys::Signature;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },

    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("payload is {found}, expected {expected}")]
    PayloadMismatch {
        expected: &'static str,
        found: String,
    },
}

pub(crate) fn to_cbor<T: Serialize>(value: &T, what: &'static str) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode {
        what,
        reason: e.to_string(),
    })?;
    Ok(buf)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8], what: &'static str) -> Result<T, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode {
        what,
        reason: e.to_string(),
    })
}

// --- MessageType ---

/// Message discriminant. The first few values are reserved for the service's
/// built-in handling; handlers define their own above [`MessageType::FIRST_PROTOCOL`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(u32);

impl MessageType {
    pub const PING: MessageType = MessageType(0);
    pub const PONG: MessageType = MessageType(1);
    pub const ERROR: MessageType = MessageType(2);

    pub const FIRST_PROTOCOL: u32 = 100;

    pub const fn new(code: u32) -> Self {
        Self(code)
    }

    pub const fn code(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::PING => f.write_str("PING"),
            Self::PONG => f.write_str("PONG"),
            Self::ERROR => f.write_str("ERROR"),
            Self(code) => write!(f, "TYPE_{code}"),
        }
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// --- Payload ---

/// A value that can travel inside a [`Payload`].
pub trait PayloadType: Serialize + DeserializeOwned {
    const TYPE_URL: &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub type_url: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl Payload {
    pub fn pack<T: PayloadType>(value: &T) -> Result<Self, CodecError> {
        Ok(Self {
            type_url: T::TYPE_URL.to_string(),
            value: to_cbor(value, T::TYPE_URL)?,
        })
    }

    pub fn is<T: PayloadType>(&self) -> bool {
        self.type_url == T::TYPE_URL
    }

    pub fn unpack<T: PayloadType>(&self) -> Result<T, CodecError> {
        if !self.is::<T>() {
            return Err(CodecError::PayloadMismatch {
                expected: T::TYPE_URL,
                found: self.type_url.clone(),
            });
        }
        from_cbor(&self.value, T::TYPE_URL)
    }
}

/// Payload of an ERROR message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub message: String,
}

impl PayloadType for ErrorPayload {
    const TYPE_URL: &'static str = "courier/Error";
}

// --- Message / Envelope ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub payload: Option<Payload>,
    pub request_id: i32,
    pub is_response: bool,
}

impl Message {
    /// The exact bytes a signature covers.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        to_cbor(self, "message")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Message,
    pub signature: Signature,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        to_cbor(self, "envelope")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        from_cbor(bytes, "envelope")
    }

    pub fn msg_type(&self) -> MessageType {
        self.message.msg_type
    }

    pub fn request_id(&self) -> i32 {
        self.message.request_id
    }
}

/// A fresh non-negative 31-bit request id.
pub fn random_request_id() -> i32 {
    (rand::random::<u32>() >> 1) as i32
}
