//! Per-peer outbound connection manager.
//!
//! A [`Sender`] owns at most one stream to its peer and serializes every
//! exchange with that peer behind one lock, held for the full write + read
//! cycle. While an exchange is in progress the stream is owned by the
//! exchange itself, not by the sender state. If the exchange fails, times
//! out, or is dropped mid-flight, the stream never returns to the state and
//! the next exchange opens a fresh one.
//!
//! Every operation takes one deadline covering the wait for the lock, the
//! stream open and the exchange itself.
//!
//! ```text
//! Empty ──open──▶ Ready ──T exchanges──▶ Draining (background close) ──▶ Empty
//!   └──────────────┴──── unrecoverable error / eviction ──▶ Invalid
//! ```

use std::sync::Arc;

use courier_keys::PeerId;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::ServiceError;
use crate::config::ServiceConfig;
use crate::message::Envelope;
use crate::metrics::ServiceMetrics;
use crate::transport::{BoxStream, PeerStream, Transport, TransportError, framing};

#[derive(Default)]
struct SenderState {
    stream: Option<BoxStream>,
    invalid: bool,
    /// Successful exchanges on the current stream.
    exchanges: u32,
}

impl SenderState {
    fn reset_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.reset();
        }
        self.exchanges = 0;
    }
}

pub(crate) struct Sender {
    peer: PeerId,
    protocol: String,
    transport: Arc<dyn Transport>,
    reuse_threshold: u32,
    max_frame_size: usize,
    metrics: Arc<ServiceMetrics>,
    /// Service-wide shutdown; aborts background closes.
    shutdown: CancellationToken,
    state: Mutex<SenderState>,
}

impl Sender {
    pub(crate) fn new(
        peer: PeerId,
        protocol: &str,
        transport: Arc<dyn Transport>,
        config: &ServiceConfig,
        metrics: Arc<ServiceMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            peer,
            protocol: protocol.to_string(),
            transport,
            reuse_threshold: config.stream_reuse_threshold,
            max_frame_size: config.max_frame_size,
            metrics,
            shutdown,
            state: Mutex::new(SenderState::default()),
        }
    }

    pub(crate) fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Make sure a stream is open, invalidating the sender if that fails.
    pub(crate) async fn prep_or_invalidate(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let mut st = self.lock_state(deadline, cancel).await?;
        match self.take_stream(&mut st, deadline, cancel).await {
            Ok(stream) => {
                st.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                Self::invalidate_locked(&mut st);
                Err(e)
            }
        }
    }

    pub(crate) async fn invalidate(&self) {
        Self::invalidate_locked(&mut *self.state.lock().await);
    }

    fn invalidate_locked(st: &mut SenderState) {
        st.invalid = true;
        st.reset_stream();
    }

    fn timed_out(&self) -> ServiceError {
        self.metrics.timeout();
        ServiceError::Timeout
    }

    /// Wait for this peer's exchange slot.
    async fn lock_state(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, SenderState>, ServiceError> {
        let locked = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            st = tokio::time::timeout_at(deadline, self.state.lock()) => st.ok(),
        };
        locked.ok_or_else(|| {
            debug!(peer = %self.peer.short(), "gave up waiting for the peer's sender");
            self.timed_out()
        })
    }

    /// Hand out the current stream, opening one if there is none.
    async fn take_stream(
        &self,
        st: &mut SenderState,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<BoxStream, ServiceError> {
        if st.invalid {
            return Err(ServiceError::SenderInvalidated(self.peer));
        }
        if let Some(stream) = st.stream.take() {
            return Ok(stream);
        }

        let open = tokio::time::timeout_at(deadline, self.transport.open_stream(&self.peer, &self.protocol));
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.timed_out()),
            opened = open => opened.map_err(|_| self.timed_out())??,
        };
        debug!(peer = %self.peer.short(), protocol = %self.protocol, "opened stream");
        self.metrics.stream_opened();
        st.exchanges = 0;
        Ok(stream)
    }

    /// Return a stream after a successful exchange, or retire it once it has
    /// carried `reuse_threshold` exchanges.
    fn finish_exchange(&self, st: &mut SenderState, stream: BoxStream) {
        st.exchanges += 1;
        if self.reuse_threshold > 0 && st.exchanges >= self.reuse_threshold {
            st.exchanges = 0;
            self.metrics.stream_recycled();
            self.schedule_close(stream);
        } else {
            st.stream = Some(stream);
        }
    }

    fn schedule_close(&self, mut stream: BoxStream) {
        let peer = self.peer;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let closed = tokio::select! {
                _ = shutdown.cancelled() => false,
                result = stream.close() => {
                    if let Err(e) = result {
                        debug!(peer = %peer.short(), error = %e, "error closing recycled stream");
                    }
                    true
                }
            };
            if !closed {
                stream.reset();
            }
        });
    }

    /// Write one envelope. A broken stream is replaced and the write retried once.
    ///
    /// A peer that stops reading stalls the write; past `deadline` the stream
    /// is discarded and [`ServiceError::Timeout`] returned.
    pub(crate) async fn send_message(
        &self,
        envelope: &Envelope,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let bytes = envelope.to_bytes()?;
        let mut st = self.lock_state(deadline, cancel).await?;
        let mut retried = false;

        loop {
            let mut stream = self.take_stream(&mut st, deadline, cancel).await?;
            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout_at(deadline, framing::write_frame(stream.as_mut(), &bytes)) => r.ok(),
            };
            match written {
                None => {
                    stream.reset();
                    debug!(peer = %self.peer.short(), "write stalled, discarding stream");
                    return Err(self.timed_out());
                }
                Some(Ok(())) => {
                    self.metrics.message_sent();
                    self.finish_exchange(&mut st, stream);
                    return Ok(());
                }
                Some(Err(e)) => {
                    stream.reset();
                    if retried {
                        return Err(e.into());
                    }
                    debug!(peer = %self.peer.short(), error = %e, "write failed, retrying on a new stream");
                    self.metrics.retry();
                    retried = true;
                }
            }
        }
    }

    /// Write one envelope and read its response.
    ///
    /// Timeouts and cancellation surface as [`ServiceError::Timeout`] without
    /// a retry. The stream is discarded but the sender stays usable.
    pub(crate) async fn send_request(
        &self,
        envelope: &Envelope,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Envelope, ServiceError> {
        let bytes = envelope.to_bytes()?;
        let mut st = self.lock_state(deadline, cancel).await?;
        let mut retried = false;

        loop {
            let mut stream = self.take_stream(&mut st, deadline, cancel).await?;
            let exchange = async {
                framing::write_frame(stream.as_mut(), &bytes).await?;
                framing::read_frame(stream.as_mut(), self.max_frame_size)
                    .await?
                    .ok_or(TransportError::Closed)
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout_at(deadline, exchange) => r.ok(),
            };

            let failure = match result {
                None => {
                    stream.reset();
                    debug!(peer = %self.peer.short(), "request timed out, discarding stream");
                    return Err(self.timed_out());
                }
                Some(Ok(frame)) => match Envelope::from_bytes(&frame) {
                    Ok(response) => {
                        self.metrics.response_received();
                        self.finish_exchange(&mut st, stream);
                        return Ok(response);
                    }
                    Err(e) => {
                        // the stream is out of sync with the peer's framing
                        stream.reset();
                        return Err(e.into());
                    }
                },
                Some(Err(e)) => e,
            };

            stream.reset();
            if retried {
                return Err(failure.into());
            }
            debug!(peer = %self.peer.short(), error = %failure, "exchange failed, retrying on a new stream");
            self.metrics.retry();
            retried = true;
        }
    }

    #[cfg(test)]
    pub(crate) async fn has_stream(&self) -> bool {
        self.state.lock().await.stream.is_some()
    }

    #[cfg(test)]
    pub(crate) async fn is_invalid(&self) -> bool {
        self.state.lock().await.invalid
    }
}
