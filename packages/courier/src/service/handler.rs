use async_trait::async_trait;
use courier_keys::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{Service, ServiceError};
use crate::message::Envelope;

/// Reachability of a peer as reported by [`Service::ping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Envelopes produced by [`Handler::handle_stream`]. An `Err` item ends the
/// stream and is reported to the requester as a final ERROR envelope.
pub type EnvelopeStream = mpsc::Receiver<anyhow::Result<Envelope>>;

/// A higher-level protocol riding on the [`Service`].
///
/// PING is answered by the service before a handler ever sees it. Every other
/// verified envelope, whether it arrived on a stream or a broadcast topic, is
/// passed to [`Handler::handle`].
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Protocol tag. Used as the stream protocol and as the broadcast topic.
    fn protocol(&self) -> &str;

    async fn ping(&self, service: &Service, peer: &PeerId) -> Result<PeerStatus, ServiceError> {
        service.ping(peer).await
    }

    /// Handle one verified envelope. `Ok(Some(_))` is written back to the
    /// sender; an error tears down the stream it arrived on.
    async fn handle(
        &self,
        service: &Service,
        envelope: Envelope,
        peer: &PeerId,
    ) -> anyhow::Result<Option<Envelope>>;

    /// Handle a request that expects a sequence of responses.
    async fn handle_stream(
        &self,
        _service: &Service,
        envelope: Envelope,
        _peer: &PeerId,
    ) -> anyhow::Result<EnvelopeStream> {
        anyhow::bail!("{} does not support streamed responses", envelope.msg_type())
    }
}
