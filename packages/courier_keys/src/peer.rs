//! Peer identities.
//!
//! A [`PeerId`] is the public half of a node's signing key. Envelopes claim a
//! sender by `PeerId`, and the verification key is taken directly from it, so
//! a signature that checks out proves the claim.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::encoding::{crockford_decode, crockford_encode};
use crate::error::KeyError;
use crate::keys::PublicKey;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(PublicKey);

impl PeerId {
    pub fn from_public_key(key: PublicKey) -> Self {
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// The key every envelope from this peer must verify against.
    pub fn public_key(&self) -> &PublicKey {
        &self.0
    }

    /// Short form for logs.
    pub fn short(&self) -> String {
        self.0.fingerprint()
    }
}

impl From<PublicKey> for PeerId {
    fn from(key: PublicKey) -> Self {
        Self(key)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crockford_encode(self.0.as_bytes()))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bytes = crockford_decode(trimmed)
            .map_err(|e| KeyError::invalid_peer_id(trimmed, e.to_string()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            KeyError::invalid_peer_id(trimmed, format!("expected 32 bytes, got {}", b.len()))
        })?;
        let key = PublicKey::from_bytes(bytes);
        if !key.is_valid() {
            return Err(KeyError::invalid_peer_id(trimmed, "not an ed25519 public key"));
        }
        Ok(Self(key))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            PublicKey::deserialize(deserializer).map(Self)
        }
    }
}
