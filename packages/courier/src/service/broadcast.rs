//! Broadcast fallback for peers that are only reachable through topics.
//!
//! Each service listens on `<protocol>` (network-wide requests) and
//! `<protocol>/<own peer id>` (requests and replies addressed to it). Replies
//! to a broadcast request are published to `<protocol>/<requester>`, and a
//! reply is never answered in turn.
//! Delivery is best-effort: messages may be lost, duplicated, or reordered.

use courier_keys::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Service, ServiceError};
use crate::message::Envelope;
use crate::transport::BroadcastMessage;

/// Topic on which `peer` receives messages addressed to it.
pub fn reply_topic(protocol: &str, peer: &PeerId) -> String {
    format!("{protocol}/{peer}")
}

impl Service {
    pub(crate) async fn start_broadcast_listeners(&self) -> Result<(), ServiceError> {
        let protocol = self.inner.protocol.clone();
        for topic in [protocol.clone(), reply_topic(&protocol, &self.peer_id())] {
            let rx = self.inner.transport.subscribe(&topic).await?;
            let service = self.clone();
            tokio::spawn(async move { service.serve_topic(topic, rx).await });
        }
        Ok(())
    }

    async fn serve_topic(&self, topic: String, mut rx: mpsc::Receiver<BroadcastMessage>) {
        info!(topic = %topic, "broadcast listener started");
        loop {
            let msg = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if msg.from == self.peer_id() {
                continue;
            }
            self.inner.metrics.broadcast_received();
            let Some(envelope) = self.accept_envelope(&msg.data, &msg.from) else {
                continue;
            };
            let msg_type = envelope.msg_type();
            let is_response = envelope.message.is_response;

            let response = match self.dispatch(envelope, &msg.from).await {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(e) => {
                    warn!(topic = %topic, peer = %msg.from.short(), %msg_type, error = %e, "error handling broadcast");
                    self.inner.metrics.handler_error();
                    continue;
                }
            };
            if is_response {
                debug!(peer = %msg.from.short(), %msg_type, "not answering a broadcast reply");
                continue;
            }
            debug!(peer = %msg.from.short(), msg_type = %response.msg_type(), "replying over broadcast");
            match self.publish(&response, Some(&msg.from)).await {
                Ok(()) => self.inner.metrics.broadcast_replied(),
                Err(e) => warn!(peer = %msg.from.short(), error = %e, "failed to publish broadcast reply"),
            }
        }
        debug!(topic = %topic, "broadcast listener stopped");
    }

    /// Publish a signed envelope on the protocol topic, or on `to`'s own topic.
    pub async fn publish(&self, envelope: &Envelope, to: Option<&PeerId>) -> Result<(), ServiceError> {
        let topic = match to {
            Some(peer) => reply_topic(&self.inner.protocol, peer),
            None => self.inner.protocol.clone(),
        };
        let bytes = envelope.to_bytes()?;
        self.inner.transport.publish(&topic, bytes).await?;
        Ok(())
    }

    /// Pass every verified envelope published on `topic` by another peer to
    /// `callback`, until the returned token (or the service) is cancelled.
    pub async fn listen_for<F>(&self, topic: &str, mut callback: F) -> Result<CancellationToken, ServiceError>
    where
        F: FnMut(Envelope, PeerId) + Send + 'static,
    {
        let mut rx = self.inner.transport.subscribe(topic).await?;
        let token = self.inner.cancel.child_token();
        let stop = token.clone();
        let service = self.clone();
        let topic = topic.to_string();

        tokio::spawn(async move {
            debug!(topic = %topic, "listening");
            loop {
                let msg = tokio::select! {
                    _ = stop.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                if msg.from == service.peer_id() {
                    continue;
                }
                if let Some(envelope) = service.accept_envelope(&msg.data, &msg.from) {
                    callback(envelope, msg.from);
                }
            }
            debug!(topic = %topic, "stopped listening");
        });
        Ok(token)
    }
}
