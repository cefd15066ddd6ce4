//! Transport contract helpers.
//!
//! A distributed transport carries `weft.v1` messages between processes.
//! These helpers convert between runtime values and those messages through a
//! [`SerializationRegistry`], correlate responses with outstanding requests,
//! and serve inbound requests and events against any [`AgentRuntime`].

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::agent::AgentId;
use crate::envelope::new_message_id;
use crate::runtime::{AgentRuntime, PublishOptions, SendOptions};
use crate::serialization::SerializationRegistry;
use crate::{proto, AnyMessage, Result, RuntimeError, TopicId};

/// Reserved metadata keys.
pub mod keys {
    /// Milliseconds since epoch at which the message was encoded.
    pub const TIMESTAMP_MS: &str = "ts";
}

fn stamp() -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(
        keys::TIMESTAMP_MS.to_string(),
        chrono::Utc::now().timestamp_millis().to_string(),
    );
    metadata
}

fn missing(field: &str) -> RuntimeError {
    RuntimeError::handler(format!("wire message is missing {}", field))
}

/// Matches `RpcResponse`s to pending requests by request id.
#[derive(Debug, Default)]
pub struct RpcCorrelator {
    pending: DashMap<String, oneshot::Sender<proto::RpcResponse>>,
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id and the receiver its response will arrive on.
    pub fn begin(&self) -> (String, oneshot::Receiver<proto::RpcResponse>) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);
        (request_id, rx)
    }

    /// Hand `response` to its waiting request. False if nothing was waiting
    /// for that id.
    pub fn complete(&self, response: proto::RpcResponse) -> bool {
        match self.pending.remove(&response.request_id) {
            Some((request_id, tx)) => {
                if tx.send(response).is_err() {
                    debug!(target: "runtime", request_id = %request_id, "Requester went away");
                }
                true
            }
            None => {
                warn!(target: "runtime", request_id = %response.request_id, "Response for unknown request");
                false
            }
        }
    }

    /// Forget a request; its receiver resolves with an error.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// A decoded `RpcRequest`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub request_id: String,
    pub sender: Option<AgentId>,
    pub recipient: AgentId,
    pub message: AnyMessage,
}

/// A decoded `Event`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub topic: TopicId,
    pub sender: Option<AgentId>,
    pub message_id: String,
    pub message: AnyMessage,
}

pub fn encode_request(
    registry: &SerializationRegistry,
    request_id: &str,
    message: &AnyMessage,
    sender: Option<&AgentId>,
    recipient: &AgentId,
    content_type: &str,
) -> Result<proto::RpcRequest> {
    Ok(proto::RpcRequest {
        request_id: request_id.to_string(),
        source: sender.map(proto::AgentId::from),
        target: Some(proto::AgentId::from(recipient)),
        payload: Some(registry.to_payload(message, content_type)?),
        metadata: stamp(),
    })
}

pub fn decode_request(
    registry: &SerializationRegistry,
    request: &proto::RpcRequest,
) -> Result<InboundRequest> {
    let recipient = request.target.clone().ok_or_else(|| missing("target"))?;
    let payload = request.payload.as_ref().ok_or_else(|| missing("payload"))?;
    Ok(InboundRequest {
        request_id: request.request_id.clone(),
        sender: request.source.clone().map(AgentId::from),
        recipient: AgentId::from(recipient),
        message: registry.from_payload(payload)?,
    })
}

/// Errors travel as a typed `RpcError`; a reply-less success has neither
/// payload nor error.
pub fn encode_response(
    registry: &SerializationRegistry,
    request_id: &str,
    result: &Result<Option<AnyMessage>>,
    content_type: &str,
) -> Result<proto::RpcResponse> {
    let (payload, error) = match result {
        Ok(Some(reply)) => (Some(registry.to_payload(reply, content_type)?), None),
        Ok(None) => (None, None),
        Err(e) => (None, Some(proto::RpcError::from(e))),
    };
    Ok(proto::RpcResponse {
        request_id: request_id.to_string(),
        payload,
        error,
        metadata: stamp(),
    })
}

/// The reply, or the remote error rebuilt as the matching [`RuntimeError`].
pub fn decode_response(
    registry: &SerializationRegistry,
    response: &proto::RpcResponse,
) -> Result<Option<AnyMessage>> {
    if let Some(error) = &response.error {
        return Err(RuntimeError::from(error.clone()));
    }
    response
        .payload
        .as_ref()
        .map(|payload| registry.from_payload(payload))
        .transpose()
        .map_err(RuntimeError::from)
}

pub fn encode_event(
    registry: &SerializationRegistry,
    message: &AnyMessage,
    topic: &TopicId,
    sender: Option<&AgentId>,
    content_type: &str,
) -> Result<proto::Event> {
    Ok(proto::Event {
        topic: Some(proto::TopicId::from(topic)),
        source: sender.map(proto::AgentId::from),
        payload: Some(registry.to_payload(message, content_type)?),
        message_id: new_message_id(),
        metadata: stamp(),
    })
}

pub fn decode_event(registry: &SerializationRegistry, event: &proto::Event) -> Result<InboundEvent> {
    let topic = event.topic.clone().ok_or_else(|| missing("topic"))?;
    let payload = event.payload.as_ref().ok_or_else(|| missing("payload"))?;
    Ok(InboundEvent {
        topic: TopicId::from(topic),
        sender: event.source.clone().map(AgentId::from),
        message_id: event.message_id.clone(),
        message: registry.from_payload(payload)?,
    })
}

/// Run an inbound request against `runtime` and encode the outcome. The
/// reply uses the request payload's content type.
pub async fn serve_request(
    runtime: &dyn AgentRuntime,
    registry: &SerializationRegistry,
    request: &proto::RpcRequest,
) -> proto::RpcResponse {
    let content_type = request
        .payload
        .as_ref()
        .map(|p| p.data_content_type.clone())
        .unwrap_or_default();

    let result = match decode_request(registry, request) {
        Ok(inbound) => {
            let mut options = SendOptions::new().message_id(inbound.request_id.clone());
            options.sender = inbound.sender;
            runtime
                .send_message(inbound.message, inbound.recipient, options)
                .await
        }
        Err(e) => Err(e),
    };

    encode_response(registry, &request.request_id, &result, &content_type).unwrap_or_else(|e| {
        proto::RpcResponse {
            request_id: request.request_id.clone(),
            payload: None,
            error: Some(proto::RpcError::from(&e)),
            metadata: stamp(),
        }
    })
}

/// Publish an inbound event on `runtime`.
pub async fn serve_event(
    runtime: &dyn AgentRuntime,
    registry: &SerializationRegistry,
    event: &proto::Event,
) -> Result<()> {
    let inbound = decode_event(registry, event)?;
    let mut options = PublishOptions::new().message_id(inbound.message_id);
    options.sender = inbound.sender;
    runtime
        .publish_message(inbound.message, inbound.topic, options)
        .await
}
