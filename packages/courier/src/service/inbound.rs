//! Inbound side: per-stream read loops and message dispatch.

use std::sync::{Arc, Weak};

use courier_keys::PeerId;
use tracing::{debug, warn};

use super::{Service, ServiceInner};
use crate::codec::Codec;
use crate::message::{Envelope, MessageType};
use crate::transport::{BoxStream, PeerStream, StreamHandler, framing};

/// Transport callback spawning one [`Service::serve_stream`] task per stream.
///
/// Holds the service weakly so the transport's handler table does not keep a
/// dropped service alive.
pub(crate) fn stream_handler(inner: Weak<ServiceInner>) -> StreamHandler {
    Arc::new(move |peer: PeerId, mut stream: BoxStream| {
        let Some(inner) = inner.upgrade() else {
            stream.reset();
            return;
        };
        let service = Service { inner };
        tokio::spawn(async move { service.serve_stream(peer, stream).await });
    })
}

impl Service {
    /// Read envelopes off one inbound stream until it closes, goes idle, or a
    /// handler fails.
    pub(crate) async fn serve_stream(&self, peer: PeerId, mut stream: BoxStream) {
        let metrics = &self.inner.metrics;
        let idle = self.inner.config.idle_stream_timeout;
        let max_frame = self.inner.config.max_frame_size;
        metrics.inbound_stream_opened();
        debug!(peer = %peer.short(), "inbound stream opened");

        loop {
            let read = tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    stream.reset();
                    break;
                }
                read = tokio::time::timeout(idle, framing::read_frame(stream.as_mut(), max_frame)) => read,
            };

            let frame = match read {
                Err(_) => {
                    debug!(peer = %peer.short(), idle_secs = idle.as_secs(), "inbound stream idle, resetting");
                    metrics.idle_reset();
                    stream.reset();
                    break;
                }
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    let _ = stream.close().await;
                    break;
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer.short(), error = %e, "inbound stream read failed");
                    stream.reset();
                    break;
                }
            };

            let Some(envelope) = self.accept_envelope(&frame, &peer) else {
                continue;
            };

            // the idle timer also bounds handling and writing the reply
            let handled = tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    stream.reset();
                    break;
                }
                handled = tokio::time::timeout(idle, self.respond(envelope, &peer, stream.as_mut())) => handled,
            };
            match handled {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(peer = %peer.short(), error = %e, "resetting inbound stream");
                    stream.reset();
                    break;
                }
                Err(_) => {
                    warn!(peer = %peer.short(), idle_secs = idle.as_secs(), "handling exceeded the idle timeout, resetting");
                    metrics.idle_reset();
                    stream.reset();
                    break;
                }
            }
        }

        metrics.inbound_stream_closed();
        debug!(peer = %peer.short(), "inbound stream closed");
    }

    /// Dispatch one envelope and write back whatever the handler answers.
    async fn respond(&self, envelope: Envelope, peer: &PeerId, stream: &mut dyn PeerStream) -> anyhow::Result<()> {
        let response = match self.dispatch(envelope, peer).await {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "handler failed");
                self.inner.metrics.handler_error();
                return Err(e);
            }
        };
        framing::write_frame(stream, &response.to_bytes()?).await?;
        Ok(())
    }

    /// Decode and verify one inbound frame. Failures are logged and counted,
    /// never reported to the peer.
    pub(crate) fn accept_envelope(&self, frame: &[u8], peer: &PeerId) -> Option<Envelope> {
        let envelope = match Envelope::from_bytes(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "dropping undecodable envelope");
                self.inner.metrics.message_dropped();
                return None;
            }
        };
        if let Err(e) = Codec::verify(&envelope, peer) {
            warn!(
                peer = %peer.short(),
                msg_type = %envelope.msg_type(),
                error = %e,
                "dropping envelope that failed verification"
            );
            self.inner.metrics.message_dropped();
            return None;
        }
        self.inner.metrics.message_received();
        Some(envelope)
    }

    /// Built-in handling first, then the protocol handler.
    pub(crate) async fn dispatch(&self, envelope: Envelope, peer: &PeerId) -> anyhow::Result<Option<Envelope>> {
        debug!(peer = %peer.short(), msg_type = %envelope.msg_type(), "received");
        if envelope.msg_type() == MessageType::PING && !envelope.message.is_response {
            let pong = self.new_envelope(MessageType::PONG, None, Some(envelope.request_id()), true)?;
            return Ok(Some(pong));
        }
        self.inner.handler.handle(self, envelope, peer).await
    }
}
