//! Envelope construction and verification.

use std::sync::Arc;

use courier_keys::{KeyError, PeerId, SigningKey};
use thiserror::Error;

use crate::message::{CodecError, Envelope, ErrorPayload, Message, MessageType, Payload, random_request_id};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Signature(#[from] KeyError),
}

/// Signs outgoing messages with the local node key.
#[derive(Clone)]
pub struct Codec {
    signing_key: Arc<SigningKey>,
    peer_id: PeerId,
}

impl Codec {
    pub fn new(signing_key: SigningKey) -> Self {
        let peer_id = PeerId::from(signing_key.public_key());
        Self {
            signing_key: Arc::new(signing_key),
            peer_id,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Serialize and sign a message. A missing `request_id` gets a fresh random one.
    pub fn build(
        &self,
        msg_type: MessageType,
        payload: Option<Payload>,
        request_id: Option<i32>,
        is_response: bool,
    ) -> Result<Envelope, CodecError> {
        let message = Message {
            msg_type,
            payload,
            request_id: request_id.unwrap_or_else(random_request_id),
            is_response,
        };
        let signature = self.signing_key.sign(&message.signing_bytes()?);
        Ok(Envelope { message, signature })
    }

    /// Signed ERROR response to `request_id`.
    pub fn build_error(&self, code: u32, message: &str, request_id: i32) -> Result<Envelope, CodecError> {
        let payload = Payload::pack(&ErrorPayload {
            code,
            message: message.to_string(),
        })?;
        self.build(MessageType::ERROR, Some(payload), Some(request_id), true)
    }

    /// Check that `envelope` was signed by `claimed`.
    pub fn verify(envelope: &Envelope, claimed: &PeerId) -> Result<(), VerifyError> {
        let bytes = envelope.message.signing_bytes()?;
        courier_keys::verify(claimed.public_key(), &bytes, &envelope.signature)?;
        Ok(())
    }
}
