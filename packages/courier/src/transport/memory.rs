//! In-process transport over `tokio::io::duplex`.
//!
//! Every node joined to a [`MemoryNetwork`] can open streams to every other
//! node and share topics. Nodes can be taken offline to simulate unreachable
//! peers or stalled so that opens to them never complete. The network counts
//! streams opened to each node.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;

use async_trait::async_trait;
use courier_keys::PeerId;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::{BoxStream, BroadcastMessage, PeerStream, StreamHandler, Transport, TransportError};

const STREAM_BUFFER: usize = 64 * 1024;
const TOPIC_BUFFER: usize = 256;

// --- MemoryStream ---

pub struct MemoryStream {
    io: Option<DuplexStream>,
}

impl MemoryStream {
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(STREAM_BUFFER);
        (Self { io: Some(a) }, Self { io: Some(b) })
    }
}

#[async_trait]
impl PeerStream for MemoryStream {
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let io = self.io.as_mut().ok_or(TransportError::Reset)?;
        match io.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(TransportError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let io = self.io.as_mut().ok_or(TransportError::Reset)?;
        match io.write_all(buf).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(TransportError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    fn reset(&mut self) {
        self.io = None;
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut io) = self.io.take() {
            io.shutdown().await?;
        }
        Ok(())
    }
}

// --- MemoryNetwork ---

#[derive(Default)]
struct Node {
    handlers: HashMap<String, StreamHandler>,
    offline: bool,
    stalled: bool,
    streams_opened: usize,
}

struct Subscription {
    peer: PeerId,
    tx: mpsc::Sender<BroadcastMessage>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, Node>,
    topics: HashMap<String, Vec<Subscription>>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, peer: PeerId) -> Arc<MemoryTransport> {
        self.state.lock().await.nodes.entry(peer).or_default();
        Arc::new(MemoryTransport {
            local: peer,
            network: self.clone(),
        })
    }

    /// Offline nodes refuse new streams and miss topic messages. Streams that
    /// are already open keep working.
    pub async fn set_offline(&self, peer: &PeerId, offline: bool) {
        self.state.lock().await.nodes.entry(*peer).or_default().offline = offline;
    }

    /// Stream opens to a stalled node hang until the caller gives up.
    pub async fn set_stalled(&self, peer: &PeerId, stalled: bool) {
        self.state.lock().await.nodes.entry(*peer).or_default().stalled = stalled;
    }

    /// Number of streams other nodes have opened to `peer`.
    pub async fn streams_opened_to(&self, peer: &PeerId) -> usize {
        self.state
            .lock()
            .await
            .nodes
            .get(peer)
            .map_or(0, |node| node.streams_opened)
    }
}

pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream, TransportError> {
        let handler = {
            let mut state = self.network.state.lock().await;
            let node = state
                .nodes
                .get_mut(peer)
                .ok_or_else(|| TransportError::unreachable(peer, "unknown peer"))?;
            if node.offline {
                return Err(TransportError::unreachable(peer, "peer is offline"));
            }
            let handler = node
                .handlers
                .get(protocol)
                .cloned()
                .ok_or_else(|| TransportError::unreachable(peer, format!("protocol {protocol} not supported")))?;
            (!node.stalled).then(|| {
                node.streams_opened += 1;
                handler
            })
        };
        let Some(handler) = handler else {
            debug!(peer = %peer.short(), "stream open stalled");
            return std::future::pending().await;
        };

        let (local, remote) = MemoryStream::pair();
        handler(self.local, Box::new(remote));
        Ok(Box::new(local))
    }

    async fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        let mut state = self.network.state.lock().await;
        state
            .nodes
            .entry(self.local)
            .or_default()
            .handlers
            .insert(protocol.to_string(), handler);
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BroadcastMessage>, TransportError> {
        let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
        let mut state = self.network.state.lock().await;
        state.topics.retain(|_, subs| {
            subs.retain(|s| !s.tx.is_closed());
            !subs.is_empty()
        });
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { peer: self.local, tx });
        Ok(rx)
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.network.state.lock().await;
        let NetworkState { nodes, topics } = &mut *state;
        let Some(subscriptions) = topics.get_mut(topic) else {
            return Ok(());
        };
        subscriptions.retain(|s| !s.tx.is_closed());
        if subscriptions.is_empty() {
            topics.remove(topic);
            return Ok(());
        }

        let message = BroadcastMessage { from: self.local, data };
        for sub in subscriptions.iter() {
            if nodes.get(&sub.peer).is_some_and(|node| node.offline) {
                continue;
            }
            if sub.tx.try_send(message.clone()).is_err() {
                debug!(topic, peer = %sub.peer.short(), "subscriber lagging, dropping topic message");
            }
        }
        Ok(())
    }
}
