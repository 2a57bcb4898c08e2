//! Courier: signed peer-to-peer messaging.
//!
//! A [`Service`] sends and receives [`Envelope`]s on behalf of one protocol
//! [`Handler`], over any [`transport::Transport`]. Outbound exchanges with a
//! peer are serialized through that peer's sender; inbound envelopes are
//! verified before any handler sees them.

pub mod codec;
pub mod config;
pub mod echo;
pub mod identity;
pub mod message;
pub mod metrics;
pub mod service;
pub mod transport;

pub use codec::Codec;
pub use courier_keys::{PeerId, SigningKey};
pub use message::{Envelope, MessageType, Payload, PayloadType};
pub use service::{Handler, PeerStatus, Service, ServiceError};
