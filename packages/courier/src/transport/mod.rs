//! Transport abstraction: bidirectional peer streams plus topic pub/sub.
//!
//! The service only talks to [`Transport`] and [`PeerStream`]. Two
//! implementations ship with the crate: [`iroh_transport::IrohTransport`]
//! (QUIC) and [`memory::MemoryNetwork`] (in-process).

pub mod framing;
pub mod iroh_transport;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use courier_keys::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("stream closed")]
    Closed,

    #[error("stream reset by peer")]
    Reset,

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed length prefix")]
    MalformedPrefix,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(String),
}

impl TransportError {
    pub(crate) fn unreachable(peer: &PeerId, reason: impl ToString) -> Self {
        Self::Unreachable {
            peer: peer.short(),
            reason: reason.to_string(),
        }
    }
}

/// One bidirectional byte stream to a peer.
#[async_trait]
pub trait PeerStream: Send {
    /// Fill `buf` completely. End-of-stream before that is [`TransportError::Closed`].
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Abort both directions immediately.
    fn reset(&mut self);

    /// Finish the send side and release the stream.
    async fn close(&mut self) -> Result<(), TransportError>;
}

pub type BoxStream = Box<dyn PeerStream>;

/// Called for every stream a remote peer opens on a registered protocol.
pub type StreamHandler = Arc<dyn Fn(PeerId, BoxStream) + Send + Sync>;

/// A topic message as delivered by the transport. `from` is the transport's
/// view of the publisher; the payload still has to verify on its own.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub from: PeerId,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_peer(&self) -> PeerId;

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream, TransportError>;

    async fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BroadcastMessage>, TransportError>;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;
}
