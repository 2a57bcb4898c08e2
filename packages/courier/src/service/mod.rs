//! Signed request/response messaging between peers.
//!
//! A [`Service`] binds one [`Handler`] to one protocol tag. Outbound traffic
//! goes through a per-peer [`sender::Sender`] kept in the registry; inbound
//! streams and broadcast topics feed the same verify + dispatch pipeline.
//!
//! At most one request is in flight per peer at any time: the sender lock is
//! held for the full write + read cycle, and responses are matched to their
//! request purely by position on the stream. Running requests to one peer in
//! parallel would need a request-id correlation map instead.

mod broadcast;
mod error;
mod handler;
mod http;
mod inbound;
mod registry;
mod sender;
mod streaming;


pub use broadcast::reply_topic;
pub use error::ServiceError;
pub use handler::{EnvelopeStream, Handler, PeerStatus};
pub use http::PEER_HEADER;
pub use streaming::ResponseStream;

use std::sync::Arc;
use std::time::Duration;

use courier_keys::PeerId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::ServiceConfig;
use crate::message::{Envelope, ErrorPayload, MessageType, Payload};
use crate::metrics::ServiceMetrics;
use crate::transport::Transport;
use registry::SenderRegistry;

pub(crate) struct ServiceInner {
    codec: Codec,
    protocol: String,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn Handler>,
    registry: SenderRegistry,
    config: ServiceConfig,
    metrics: Arc<ServiceMetrics>,
    http: reqwest::Client,
    /// Cancelled on shutdown. Listener tasks, inbound loops and pending
    /// stream closes all watch it.
    cancel: CancellationToken,
}

/// Cheap to clone; all clones share one registry and one set of listeners.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub fn new(
        codec: Codec,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn Handler>,
        config: ServiceConfig,
    ) -> Self {
        if transport.local_peer() != codec.peer_id() {
            warn!(
                transport = %transport.local_peer().short(),
                signer = %codec.peer_id().short(),
                "transport identity differs from signing identity, peers will reject our envelopes"
            );
        }
        let protocol = handler.protocol().to_string();
        let metrics = Arc::new(ServiceMetrics::new());
        let cancel = CancellationToken::new();
        let registry = SenderRegistry::new(
            &protocol,
            transport.clone(),
            config.clone(),
            metrics.clone(),
            cancel.clone(),
        );

        Self {
            inner: Arc::new(ServiceInner {
                codec,
                protocol,
                transport,
                handler,
                registry,
                config,
                metrics,
                http: reqwest::Client::new(),
                cancel,
            }),
        }
    }

    /// Register the inbound stream handler and start the broadcast listeners.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.inner
            .transport
            .set_stream_handler(&self.inner.protocol, inbound::stream_handler(Arc::downgrade(&self.inner)))
            .await;
        self.start_broadcast_listeners().await?;
        info!(peer = %self.peer_id().short(), protocol = %self.inner.protocol, "service started");
        Ok(())
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.codec.peer_id()
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.inner.handler
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.inner.metrics
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Number of peers with a live sender.
    pub async fn connected_peers(&self) -> usize {
        self.inner.registry.len().await
    }

    /// Build and sign an envelope with the local key.
    pub fn new_envelope(
        &self,
        msg_type: MessageType,
        payload: Option<Payload>,
        request_id: Option<i32>,
        is_response: bool,
    ) -> Result<Envelope, ServiceError> {
        Ok(self.inner.codec.build(msg_type, payload, request_id, is_response)?)
    }

    /// Signed ERROR response to `request_id`.
    pub fn new_error(&self, code: u32, message: &str, request_id: i32) -> Result<Envelope, ServiceError> {
        Ok(self.inner.codec.build_error(code, message, request_id)?)
    }

    pub fn verify_envelope(&self, envelope: &Envelope, peer: &PeerId) -> Result<(), ServiceError> {
        Codec::verify(envelope, peer).map_err(|e| ServiceError::from_verify(peer, e))
    }

    /// Fire-and-forget delivery over the peer's stream. Opening the stream
    /// and writing the envelope share the configured request timeout.
    pub async fn send_message(&self, peer: &PeerId, envelope: &Envelope) -> Result<(), ServiceError> {
        self.send_message_with_cancel(peer, envelope, &CancellationToken::new())
            .await
    }

    /// Like [`Service::send_message`], also giving up when `cancel` fires.
    pub async fn send_message_with_cancel(
        &self,
        peer: &PeerId,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let deadline = Instant::now() + self.inner.config.request_timeout;
        self.with_sender(peer, deadline, cancel, move |sender| async move {
            sender.send_message(envelope, deadline, cancel).await
        })
        .await
    }

    /// Send a request and wait up to the configured request timeout for its response.
    pub async fn send_request(&self, peer: &PeerId, envelope: &Envelope) -> Result<Envelope, ServiceError> {
        self.send_request_with_cancel(peer, envelope, &CancellationToken::new())
            .await
    }

    /// Like [`Service::send_request`], also giving up when `cancel` fires.
    /// Cancellation is reported as [`ServiceError::Timeout`].
    pub async fn send_request_with_cancel(
        &self,
        peer: &PeerId,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<Envelope, ServiceError> {
        self.request(peer, envelope, self.inner.config.request_timeout, cancel)
            .await
    }

    /// Reachability check. Failures of any kind report [`PeerStatus::Offline`];
    /// only a failure to build the PING locally is an error.
    pub async fn ping(&self, peer: &PeerId) -> Result<PeerStatus, ServiceError> {
        let ping = self.new_envelope(MessageType::PING, None, None, false)?;
        let cancel = CancellationToken::new();
        match self.request(peer, &ping, self.inner.config.ping_timeout, &cancel).await {
            Ok(_) => Ok(PeerStatus::Online),
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "ping failed");
                Ok(PeerStatus::Offline)
            }
        }
    }

    /// Drop the peer's sender. Returns whether one existed.
    pub async fn disconnect(&self, peer: &PeerId) -> bool {
        let removed = self.inner.registry.remove(peer).await;
        if removed {
            debug!(peer = %peer.short(), "disconnected");
        }
        removed
    }

    /// Stop every listener and inbound loop and invalidate all senders.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.registry.clear().await;
        info!(peer = %self.peer_id().short(), "service shut down");
    }

    async fn request(
        &self,
        peer: &PeerId,
        envelope: &Envelope,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Envelope, ServiceError> {
        self.inner.metrics.request_sent();
        let deadline = Instant::now() + timeout;
        let response = self
            .with_sender(peer, deadline, cancel, move |sender| async move {
                sender.send_request(envelope, deadline, cancel).await
            })
            .await?;

        self.verify_envelope(&response, peer)?;
        if response.request_id() != envelope.request_id() {
            return Err(ServiceError::UnexpectedResponse {
                expected: envelope.request_id(),
                got: response.request_id(),
            });
        }
        if response.msg_type() == MessageType::ERROR {
            return Err(remote_error(&response));
        }
        Ok(response)
    }

    /// Run `op` against the peer's sender, evicting it on transport failure.
    async fn with_sender<T, F, Fut>(
        &self,
        peer: &PeerId,
        deadline: Instant,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, ServiceError>
    where
        F: FnOnce(Arc<sender::Sender>) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(ServiceError::ShuttingDown);
        }
        let exchange = async {
            let sender = self.inner.registry.get_or_create(peer, deadline, cancel).await?;
            let result = op(sender.clone()).await;
            if let Err(e) = &result {
                if e.is_transport() {
                    debug!(peer = %peer.short(), error = %e, "evicting sender after transport failure");
                    self.inner.registry.evict(&sender).await;
                }
            }
            result
        };
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(ServiceError::ShuttingDown),
            result = exchange => result,
        }
    }
}

/// Translate an ERROR envelope into the error it carries.
pub(crate) fn remote_error(envelope: &Envelope) -> ServiceError {
    match envelope.message.payload.as_ref().map(Payload::unpack::<ErrorPayload>) {
        Some(Ok(payload)) => ServiceError::Remote {
            code: payload.code,
            message: payload.message,
        },
        Some(Err(e)) => ServiceError::Codec(e),
        None => ServiceError::Remote {
            code: 0,
            message: String::new(),
        },
    }
}
