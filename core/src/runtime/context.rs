use std::fmt;
use std::sync::Arc;

use super::{AgentRuntime, PublishOptions, SendOptions};
use crate::agent::AgentId;
use crate::message::MessageType;
use crate::{AnyMessage, CancellationToken, Result, RuntimeError, TopicId};

/// Delivery metadata and the runtime handle, passed to every handler.
///
/// Sends and publishes made through the context carry the current agent as
/// sender and share the delivery's cancellation token, so cancelling the
/// original caller unwinds the whole chain.
#[derive(Clone)]
pub struct MessageContext {
    recipient: AgentId,
    sender: Option<AgentId>,
    topic_id: Option<TopicId>,
    is_rpc: bool,
    message_id: String,
    cancellation_token: CancellationToken,
    call_chain: Vec<AgentId>,
    runtime: Arc<dyn AgentRuntime>,
}

impl MessageContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        recipient: AgentId,
        sender: Option<AgentId>,
        topic_id: Option<TopicId>,
        is_rpc: bool,
        message_id: String,
        cancellation_token: CancellationToken,
        call_chain: Vec<AgentId>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Self {
        Self {
            recipient,
            sender,
            topic_id,
            is_rpc,
            message_id,
            cancellation_token,
            call_chain,
            runtime,
        }
    }

    /// The agent handling this delivery.
    pub fn recipient(&self) -> &AgentId {
        &self.recipient
    }

    pub fn sender(&self) -> Option<&AgentId> {
        self.sender.as_ref()
    }

    /// Set for published deliveries.
    pub fn topic_id(&self) -> Option<&TopicId> {
        self.topic_id.as_ref()
    }

    /// True for `send` (a reply is awaited), false for `publish`.
    pub fn is_rpc(&self) -> bool {
        self.is_rpc
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn call_chain(&self) -> &[AgentId] {
        &self.call_chain
    }

    pub fn runtime(&self) -> &Arc<dyn AgentRuntime> {
        &self.runtime
    }

    /// Nested send on behalf of the current agent.
    pub async fn send(
        &self,
        message: impl Into<AnyMessage>,
        recipient: AgentId,
    ) -> Result<Option<AnyMessage>> {
        let mut call_chain = self.call_chain.clone();
        call_chain.push(self.recipient.clone());
        let options = SendOptions {
            sender: Some(self.recipient.clone()),
            cancellation_token: Some(self.cancellation_token.clone()),
            message_id: None,
            call_chain,
        };
        self.runtime
            .send_message(message.into(), recipient, options)
            .await
    }

    /// Nested send that expects a reply of type `R`.
    pub async fn send_expect<R: MessageType>(
        &self,
        message: impl Into<AnyMessage>,
        recipient: AgentId,
    ) -> Result<R> {
        let reply = self.send(message, recipient).await?;
        expect_reply(reply)
    }

    /// Publish on behalf of the current agent. The current agent does not
    /// receive its own publication.
    pub async fn publish(&self, message: impl Into<AnyMessage>, topic: TopicId) -> Result<()> {
        let options = PublishOptions {
            sender: Some(self.recipient.clone()),
            cancellation_token: Some(self.cancellation_token.clone()),
            message_id: None,
        };
        self.runtime
            .publish_message(message.into(), topic, options)
            .await
    }
}

pub(crate) fn expect_reply<R: MessageType>(reply: Option<AnyMessage>) -> Result<R> {
    match reply {
        Some(message) => message
            .downcast::<R>()
            .ok_or_else(|| RuntimeError::UnexpectedReply {
                expected: R::TYPE_NAME.to_string(),
                actual: message.type_name().to_string(),
            }),
        None => Err(RuntimeError::UnexpectedReply {
            expected: R::TYPE_NAME.to_string(),
            actual: "none".to_string(),
        }),
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("recipient", &self.recipient)
            .field("sender", &self.sender)
            .field("topic_id", &self.topic_id)
            .field("is_rpc", &self.is_rpc)
            .field("message_id", &self.message_id)
            .finish()
    }
}
