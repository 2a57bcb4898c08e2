//! HTTP streaming client for exchanges with more than one response.
//!
//! The request is one signed envelope POSTed as CBOR. The response body is a
//! sequence of `[u16 LE length][envelope]` frames, each verified against the
//! responder before it reaches the caller.

use courier_keys::PeerId;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::http::{CBOR_CONTENT_TYPE, PEER_HEADER};
use super::{Service, ServiceError, remote_error};
use crate::codec::Codec;
use crate::message::{CodecError, Envelope, MessageType};
use crate::transport::framing::HttpFrameDecoder;

const RESPONSE_BUFFER: usize = 16;

/// Responses of one streamed request, in arrival order.
///
/// The stream ends after the last frame, after the first error, or once
/// cancelled. Dropping it cancels the request.
pub struct ResponseStream {
    rx: mpsc::Receiver<Result<Envelope, ServiceError>>,
    cancel: CancellationToken,
}

impl ResponseStream {
    pub async fn next(&mut self) -> Option<Result<Envelope, ServiceError>> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this request from elsewhere.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Service {
    /// POST `envelope` to `url` and stream back the responses `responder` signs.
    ///
    /// `access` is sent as a Basic authorization token when given.
    pub async fn send_http_stream_request(
        &self,
        url: &str,
        responder: &PeerId,
        envelope: &Envelope,
        access: Option<&str>,
    ) -> Result<ResponseStream, ServiceError> {
        let mut request = self
            .inner
            .http
            .post(url)
            .header(PEER_HEADER, self.peer_id().to_string())
            .header(CONTENT_TYPE, CBOR_CONTENT_TYPE)
            .body(envelope.to_bytes()?);
        if let Some(token) = access {
            request = request.header(AUTHORIZATION, format!("Basic {token}"));
        }

        let cancel = self.inner.cancel.child_token();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ServiceError::ShuttingDown),
            response = request.send() => response?,
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(ServiceError::Http {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let responder = *responder;
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = HttpFrameDecoder::default();
            loop {
                let chunk = tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(peer = %responder.short(), "streamed request cancelled");
                        return;
                    }
                    chunk = body.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => decoder.extend(&bytes),
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                    None => break,
                }
                while let Some(frame) = decoder.next_frame() {
                    if stop.is_cancelled() {
                        return;
                    }
                    let item = decode_response(&frame, &responder);
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() || failed {
                        return;
                    }
                }
            }
            if decoder.pending() > 0 {
                let truncated = CodecError::Decode {
                    what: "response stream",
                    reason: format!("{} trailing bytes of an incomplete frame", decoder.pending()),
                };
                let _ = tx.send(Err(truncated.into())).await;
            }
        });

        Ok(ResponseStream { rx, cancel })
    }
}

fn decode_response(frame: &[u8], responder: &PeerId) -> Result<Envelope, ServiceError> {
    let envelope = Envelope::from_bytes(frame)?;
    Codec::verify(&envelope, responder).map_err(|e| ServiceError::from_verify(responder, e))?;
    if envelope.msg_type() == MessageType::ERROR {
        return Err(remote_error(&envelope));
    }
    Ok(envelope)
}
