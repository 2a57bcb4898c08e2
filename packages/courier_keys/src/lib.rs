//! Signing keys, detached signatures, and peer identities for courier nodes.

pub mod encoding;
pub mod error;
pub mod keys;
pub mod peer;

pub use error::KeyError;
pub use keys::{PublicKey, Signature, SigningKey, verify};
pub use peer::PeerId;
