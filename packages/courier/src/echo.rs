//! Reference protocol: echoes text back to the sender.

use async_trait::async_trait;
use courier_keys::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::message::{Envelope, MessageType, Payload, PayloadType};
use crate::service::{EnvelopeStream, Handler, Service, ServiceError};

pub const ECHO_PROTOCOL: &str = "/courier/echo/1.0.0";

pub const ECHO: MessageType = MessageType::new(MessageType::FIRST_PROTOCOL);

const BAD_REQUEST: u32 = 400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoText {
    pub text: String,
}

impl PayloadType for EchoText {
    const TYPE_URL: &'static str = "courier/EchoText";
}

pub struct EchoHandler;

impl EchoHandler {
    /// Ask `peer` to echo `text` and return what came back.
    pub async fn echo(service: &Service, peer: &PeerId, text: &str) -> Result<String, ServiceError> {
        let payload = Payload::pack(&EchoText { text: text.to_string() })?;
        let request = service.new_envelope(ECHO, Some(payload), None, false)?;
        let response = service.send_request(peer, &request).await?;
        Ok(unpack_text(&response)?)
    }
}

fn unpack_text(envelope: &Envelope) -> Result<String, crate::message::CodecError> {
    match &envelope.message.payload {
        Some(payload) => Ok(payload.unpack::<EchoText>()?.text),
        None => Ok(String::new()),
    }
}

fn reply(service: &Service, request_id: i32, text: String) -> anyhow::Result<Envelope> {
    let payload = Payload::pack(&EchoText { text })?;
    Ok(service.new_envelope(ECHO, Some(payload), Some(request_id), true)?)
}

#[async_trait]
impl Handler for EchoHandler {
    fn protocol(&self) -> &str {
        ECHO_PROTOCOL
    }

    async fn handle(
        &self,
        service: &Service,
        envelope: Envelope,
        _peer: &PeerId,
    ) -> anyhow::Result<Option<Envelope>> {
        if envelope.message.is_response {
            return Ok(None);
        }
        let request_id = envelope.request_id();
        if envelope.msg_type() != ECHO {
            let message = format!("unsupported message type {}", envelope.msg_type());
            return Ok(Some(service.new_error(BAD_REQUEST, &message, request_id)?));
        }
        match unpack_text(&envelope) {
            Ok(text) => Ok(Some(reply(service, request_id, text)?)),
            Err(e) => Ok(Some(service.new_error(BAD_REQUEST, &e.to_string(), request_id)?)),
        }
    }

    async fn handle_stream(
        &self,
        service: &Service,
        envelope: Envelope,
        _peer: &PeerId,
    ) -> anyhow::Result<EnvelopeStream> {
        anyhow::ensure!(
            envelope.msg_type() == ECHO,
            "{} does not support streamed responses",
            envelope.msg_type()
        );
        let request_id = envelope.request_id();
        let text = unpack_text(&envelope)?;
        let service = service.clone();

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for word in text.split_whitespace() {
                if tx.send(reply(&service, request_id, word.to_string())).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::config::ServiceConfig;
    use crate::message::ErrorPayload;
    use crate::transport::memory::MemoryNetwork;
    use courier_keys::SigningKey;
    use std::sync::Arc;

    async fn service() -> (Service, PeerId) {
        let network = MemoryNetwork::new();
        let codec = Codec::new(SigningKey::generate(&mut rand::rng()));
        let transport = network.join(codec.peer_id()).await;
        let service = Service::new(codec, transport, Arc::new(EchoHandler), ServiceConfig::default());
        let peer = SigningKey::generate(&mut rand::rng()).public_key().into();
        (service, peer)
    }

    fn echo_request(service: &Service, text: &str) -> Envelope {
        let payload = Payload::pack(&EchoText { text: text.into() }).unwrap();
        service.new_envelope(ECHO, Some(payload), Some(3), false).unwrap()
    }

    #[tokio::test]
    async fn echoes_text_with_request_id() {
        let (service, peer) = service().await;
        let resp = EchoHandler
            .handle(&service, echo_request(&service, "hello"), &peer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.msg_type(), ECHO);
        assert_eq!(resp.request_id(), 3);
        assert!(resp.message.is_response);
        assert_eq!(unpack_text(&resp).unwrap(), "hello");
    }

    #[tokio::test]
    async fn unknown_type_gets_bad_request() {
        let (service, peer) = service().await;
        let env = service.new_envelope(MessageType::new(150), None, Some(8), false).unwrap();
        let resp = EchoHandler.handle(&service, env, &peer).await.unwrap().unwrap();
        assert_eq!(resp.msg_type(), MessageType::ERROR);
        assert_eq!(resp.request_id(), 8);
        let err: ErrorPayload = resp.message.payload.unwrap().unpack().unwrap();
        assert_eq!(err.code, 400);
    }

    #[tokio::test]
    async fn responses_are_never_answered() {
        let (service, peer) = service().await;
        let payload = Payload::pack(&EchoText { text: "x".into() }).unwrap();
        let echo = service.new_envelope(ECHO, Some(payload), Some(1), true).unwrap();
        assert!(EchoHandler.handle(&service, echo, &peer).await.unwrap().is_none());

        let pong = service.new_envelope(MessageType::PONG, None, Some(2), true).unwrap();
        assert!(EchoHandler.handle(&service, pong, &peer).await.unwrap().is_none());
        let error = service.new_error(400, "nope", 3).unwrap();
        assert!(EchoHandler.handle(&service, error, &peer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_yields_one_envelope_per_word() {
        let (service, peer) = service().await;
        let mut rx = EchoHandler
            .handle_stream(&service, echo_request(&service, "one two  three"), &peer)
            .await
            .unwrap();
        let mut words = Vec::new();
        while let Some(env) = rx.recv().await {
            words.push(unpack_text(&env.unwrap()).unwrap());
        }
        assert_eq!(words, ["one", "two", "three"]);
    }
}
