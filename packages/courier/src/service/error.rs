use courier_keys::PeerId;
use thiserror::Error;

use crate::codec::VerifyError;
use crate::message::CodecError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("response from {} failed verification", .0.short())]
    InvalidSignature(PeerId),

    /// The remote answered with an ERROR message.
    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },

    #[error("response to request {expected} carried request id {got}")]
    UnexpectedResponse { expected: i32, got: i32 },

    #[error("sender for {} was invalidated", .0.short())]
    SenderInvalidated(PeerId),

    #[error("http status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("http request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("service is shutting down")]
    ShuttingDown,
}

impl ServiceError {
    /// Errors after which the peer's sender is evicted from the registry.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::SenderInvalidated(_))
    }

    pub(crate) fn from_verify(peer: &PeerId, err: VerifyError) -> Self {
        match err {
            VerifyError::Codec(e) => Self::Codec(e),
            VerifyError::Signature(_) => Self::InvalidSignature(*peer),
        }
    }
}
