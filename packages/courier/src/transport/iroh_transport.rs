//! iroh QUIC transport: endpoint management, per-peer connection cache,
//! stream accept loop, and one-hop topic flooding.
//!
//! The endpoint speaks exactly one ALPN, the protocol tag of the service it
//! carries. Every request stream is a QUIC bidirectional stream. Topic
//! messages travel on unidirectional streams, one per message, to every peer
//! we currently hold a connection with; receivers deliver them to local
//! subscribers and never forward them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use courier_keys::PeerId;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr, EndpointId, RelayMode, RelayUrl};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BoxStream, BroadcastMessage, PeerStream, StreamHandler, Transport, TransportError};
use crate::config::TransportConfig;
use crate::identity::NodeIdentity;
use crate::message::{from_cbor, to_cbor};

const TOPIC_BUFFER: usize = 256;

// --- Streams ---

pub struct IrohStream {
    send: SendStream,
    recv: RecvStream,
}

/// quinn reports clean finishes and resets through several error types;
/// classify by message like the rest of the stack does.
fn classify_stream_error(e: impl std::fmt::Display) -> TransportError {
    let msg = e.to_string();
    if msg.contains("reset") {
        TransportError::Reset
    } else if msg.contains("closed") || msg.contains("finished") || msg.contains("stopped") {
        TransportError::Closed
    } else {
        TransportError::Connection(msg)
    }
}

#[async_trait]
impl PeerStream for IrohStream {
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.recv.read_exact(buf).await.map_err(classify_stream_error)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.send.write_all(buf).await.map_err(classify_stream_error)
    }

    fn reset(&mut self) {
        let _ = self.send.reset(0u32.into());
        let _ = self.recv.stop(0u32.into());
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.send.finish().map_err(classify_stream_error)?;
        let _ = self.recv.stop(0u32.into());
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct TopicFrame {
    topic: String,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

// --- Shared state ---

/// State shared between the transport handle and its background tasks.
struct Shared {
    local: PeerId,
    /// Keyed by peer; the number tells two connections to the same peer apart.
    connections: Mutex<HashMap<PeerId, (u64, Connection)>>,
    next_connection: AtomicU64,
    handler: Mutex<Option<StreamHandler>>,
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<BroadcastMessage>>>>,
    max_topic_message: usize,
    cancel: CancellationToken,
}

impl Shared {
    async fn register(self: &Arc<Self>, peer: PeerId, conn: Connection) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().await.insert(peer, (id, conn.clone()));
        tokio::spawn(Self::serve_connection(self.clone(), peer, id, conn));
    }

    async fn cached(&self, peer: &PeerId) -> Option<(u64, Connection)> {
        self.connections.lock().await.get(peer).cloned()
    }

    async fn forget(&self, peer: &PeerId, id: u64) {
        let mut conns = self.connections.lock().await;
        if conns.get(peer).is_some_and(|(current, _)| *current == id) {
            conns.remove(peer);
        }
    }

    /// Accept streams the remote side opens on this connection until it closes.
    async fn serve_connection(self: Arc<Self>, peer: PeerId, id: u64, conn: Connection) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                bi = conn.accept_bi() => match bi {
                    Ok((send, recv)) => {
                        let mut stream = IrohStream { send, recv };
                        let handler = self.handler.lock().await.clone();
                        match handler {
                            Some(handler) => handler(peer, Box::new(stream)),
                            None => {
                                debug!(peer = %peer.short(), "no stream handler registered, resetting stream");
                                stream.reset();
                            }
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer.short(), error = %e, "connection closed");
                        break;
                    }
                },
                uni = conn.accept_uni() => match uni {
                    Ok(recv) => {
                        tokio::spawn(self.clone().receive_topic_message(peer, recv));
                    }
                    Err(e) => {
                        debug!(peer = %peer.short(), error = %e, "connection closed");
                        break;
                    }
                },
            }
        }
        self.forget(&peer, id).await;
    }

    async fn receive_topic_message(self: Arc<Self>, peer: PeerId, mut recv: RecvStream) {
        let bytes = match recv.read_to_end(self.max_topic_message).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "failed to read topic message");
                return;
            }
        };
        let frame: TopicFrame = match from_cbor(&bytes, "topic frame") {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "dropping malformed topic message");
                return;
            }
        };
        self.deliver(peer, frame).await;
    }

    async fn deliver(&self, from: PeerId, frame: TopicFrame) {
        let mut topics = self.topics.lock().await;
        let Some(subscribers) = topics.get_mut(&frame.topic) else {
            return;
        };
        subscribers.retain(|tx| !tx.is_closed());
        if subscribers.is_empty() {
            topics.remove(&frame.topic);
            return;
        }
        let message = BroadcastMessage {
            from,
            data: frame.data,
        };
        for tx in subscribers.iter() {
            if tx.try_send(message.clone()).is_err() {
                debug!(topic = %frame.topic, "subscriber lagging, dropping topic message");
            }
        }
    }
}

// --- Transport ---

pub struct IrohTransport {
    endpoint: Endpoint,
    protocol: String,
    relay_url: Option<RelayUrl>,
    shared: Arc<Shared>,
}

impl IrohTransport {
    /// Bind an endpoint speaking `protocol` and start accepting connections.
    pub async fn bind(identity: &NodeIdentity, protocol: &str, config: &TransportConfig) -> Result<Self> {
        let relay_url: Option<RelayUrl> = config
            .relay_url
            .as_deref()
            .map(|url| url.parse::<RelayUrl>())
            .transpose()
            .context("invalid relay URL")?;

        let relay_mode = match (&relay_url, config.use_public_relays) {
            (Some(url), _) => RelayMode::Custom(iroh::RelayMap::from(url.clone())),
            (None, true) => RelayMode::Default,
            (None, false) => RelayMode::Disabled,
        };

        // Keepalive every 15s so idle cached connections survive NAT timeouts.
        let transport_config = iroh::endpoint::QuicTransportConfig::builder()
            .keep_alive_interval(Duration::from_secs(15))
            .max_idle_timeout(Some(iroh::endpoint::IdleTimeout::from(
                iroh::endpoint::VarInt::from_u32(60_000),
            )))
            .build();

        let endpoint = Endpoint::builder()
            .secret_key(identity.iroh_secret_key())
            .alpns(vec![protocol.as_bytes().to_vec()])
            .relay_mode(relay_mode)
            .transport_config(transport_config)
            .bind()
            .await
            .context("failed to bind iroh endpoint")?;

        let shared = Arc::new(Shared {
            local: identity.peer_id(),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            handler: Mutex::new(None),
            topics: Mutex::new(HashMap::new()),
            max_topic_message: config.max_topic_message,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Self::accept_loop(endpoint.clone(), shared.clone()));

        info!(peer = %identity.peer_id().short(), protocol, "iroh transport started");

        Ok(Self {
            endpoint,
            protocol: protocol.to_string(),
            relay_url,
            shared,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.connections.lock().await.keys().copied().collect()
    }

    pub async fn shutdown(&self) {
        info!("shutting down iroh transport");
        self.shared.cancel.cancel();
        for (peer, (_, conn)) in self.shared.connections.lock().await.drain() {
            debug!(peer = %peer.short(), "closing connection");
            conn.close(0u32.into(), b"shutdown");
        }
        self.endpoint.close().await;
        info!("iroh transport shut down");
    }

    async fn accept_loop(endpoint: Endpoint, shared: Arc<Shared>) {
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => {
                    info!("accept loop cancelled");
                    break;
                }
                incoming = endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        info!("endpoint closed, accept loop exiting");
                        break;
                    };

                    let conn = match incoming.accept() {
                        Ok(connecting) => match connecting.await {
                            Ok(conn) => conn,
                            Err(e) => {
                                error!("connection handshake failed: {}", e);
                                continue;
                            }
                        },
                        Err(e) => {
                            error!("failed to accept incoming connection: {}", e);
                            continue;
                        }
                    };

                    let peer = PeerId::from_bytes(*conn.remote_id().as_bytes());
                    debug!(peer = %peer.short(), "accepted connection");
                    shared.register(peer, conn).await;
                }
            }
        }
    }

    async fn connect(&self, peer: &PeerId) -> Result<Connection, TransportError> {
        let endpoint_id =
            EndpointId::from_bytes(peer.as_bytes()).map_err(|e| TransportError::unreachable(peer, e))?;
        let mut target = EndpointAddr::new(endpoint_id);
        if let Some(url) = &self.relay_url {
            target = target.with_relay_url(url.clone());
        }

        let conn = self
            .endpoint
            .connect(target, self.protocol.as_bytes())
            .await
            .map_err(|e| TransportError::unreachable(peer, e))?;
        debug!(peer = %peer.short(), "connected");
        self.shared.register(*peer, conn.clone()).await;
        Ok(conn)
    }
}

#[async_trait]
impl Transport for IrohTransport {
    fn local_peer(&self) -> PeerId {
        self.shared.local
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream, TransportError> {
        if protocol != self.protocol {
            return Err(TransportError::unreachable(
                peer,
                format!("endpoint is bound to {}, not {protocol}", self.protocol),
            ));
        }

        if let Some((id, conn)) = self.shared.cached(peer).await {
            match conn.open_bi().await {
                Ok((send, recv)) => return Ok(Box::new(IrohStream { send, recv })),
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "cached connection unusable, reconnecting");
                    self.shared.forget(peer, id).await;
                }
            }
        }

        let conn = self.connect(peer).await?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::unreachable(peer, e))?;
        Ok(Box::new(IrohStream { send, recv }))
    }

    async fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        if protocol != self.protocol {
            warn!(protocol, bound = %self.protocol, "ignoring stream handler for a protocol this endpoint does not speak");
            return;
        }
        *self.shared.handler.lock().await = Some(handler);
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BroadcastMessage>, TransportError> {
        let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
        let mut topics = self.shared.topics.lock().await;
        topics.retain(|_, subscribers| {
            subscribers.retain(|tx| !tx.is_closed());
            !subscribers.is_empty()
        });
        topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let frame = TopicFrame {
            topic: topic.to_string(),
            data,
        };
        let bytes = to_cbor(&frame, "topic frame").map_err(|e| TransportError::Connection(e.to_string()))?;
        if bytes.len() > self.shared.max_topic_message {
            return Err(TransportError::FrameTooLarge {
                len: bytes.len(),
                max: self.shared.max_topic_message,
            });
        }

        let peers: Vec<(PeerId, Connection)> = self
            .shared
            .connections
            .lock()
            .await
            .iter()
            .map(|(peer, (_, conn))| (*peer, conn.clone()))
            .collect();

        let sends = peers.into_iter().map(|(peer, conn)| {
            let bytes = &bytes;
            async move {
                let result = async {
                    let mut send = conn.open_uni().await.map_err(classify_stream_error)?;
                    send.write_all(bytes).await.map_err(classify_stream_error)?;
                    send.finish().map_err(classify_stream_error)
                }
                .await;
                if let Err(e) = result {
                    debug!(peer = %peer.short(), topic, error = %e, "failed to forward topic message");
                }
            }
        });
        futures::future::join_all(sends).await;
        Ok(())
    }
}
