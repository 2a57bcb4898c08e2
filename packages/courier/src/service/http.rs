//! HTTP server side of streamed requests.

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::post,
};
use courier_keys::PeerId;
use tracing::{debug, warn};

use super::Service;
use crate::message::Envelope;
use crate::transport::framing::encode_http_frame;

/// Header carrying the requester's peer id.
pub const PEER_HEADER: &str = "x-courier-peer";

pub(crate) const CBOR_CONTENT_TYPE: &str = "application/cbor";
const FRAMED_CONTENT_TYPE: &str = "application/octet-stream";

type HttpError = (StatusCode, String);

impl Service {
    /// `POST /`: verify the enveloped request, run [`super::Handler::handle_stream`],
    /// and stream each response back as a length-prefixed frame.
    pub fn http_router(&self) -> Router {
        Router::new()
            .route("/", post(stream_request))
            .with_state(self.clone())
    }
}

async fn stream_request(
    State(service): State<Service>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    let peer: PeerId = headers
        .get(PEER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("missing {PEER_HEADER} header")))?
        .parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{e}")))?;

    let envelope =
        Envelope::from_bytes(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    if let Err(e) = service.verify_envelope(&envelope, &peer) {
        warn!(peer = %peer.short(), error = %e, "rejecting streamed request");
        service.metrics().message_dropped();
        return Err((StatusCode::UNAUTHORIZED, e.to_string()));
    }
    service.metrics().message_received();

    let request_id = envelope.request_id();
    debug!(peer = %peer.short(), msg_type = %envelope.msg_type(), "streamed request");
    let responses = service
        .handler()
        .handle_stream(&service, envelope, &peer)
        .await
        .map_err(|e| {
            service.metrics().handler_error();
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    let frames = futures::stream::unfold(
        Some((responses, service, request_id)),
        |state| async move {
            let (mut responses, service, request_id) = state?;
            let (frame, next) = match responses.recv().await? {
                Ok(envelope) => (encode(&envelope), Some((responses, service, request_id))),
                Err(e) => {
                    warn!(error = %e, "streamed handler failed");
                    service.metrics().handler_error();
                    let frame = service
                        .new_error(500, &e.to_string(), request_id)
                        .map_err(std::io::Error::other)
                        .and_then(|envelope| encode(&envelope));
                    (frame, None)
                }
            };
            Some((frame, next))
        },
    );

    Ok(([(CONTENT_TYPE, FRAMED_CONTENT_TYPE)], Body::from_stream(frames)).into_response())
}

fn encode(envelope: &Envelope) -> Result<Vec<u8>, std::io::Error> {
    let bytes = envelope.to_bytes().map_err(std::io::Error::other)?;
    encode_http_frame(&bytes).map_err(std::io::Error::other)
}
