use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid peer id {input:?}: {reason}")]
    InvalidPeerId { input: String, reason: String },
}

impl KeyError {
    pub(crate) fn invalid_peer_id(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPeerId {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}
