use tokio::sync::oneshot;

use crate::agent::AgentId;
use crate::{AnyMessage, CancellationToken, Result, RuntimeError, TopicId};

/// Completes the sender's pending `send_message`.
pub(crate) type ReplySlot = oneshot::Sender<Result<Option<AnyMessage>>>;

/// Unicast request awaiting a reply.
pub(crate) struct SendEnvelope {
    pub message: AnyMessage,
    pub sender: Option<AgentId>,
    pub recipient: AgentId,
    pub token: CancellationToken,
    pub message_id: String,
    pub call_chain: Vec<AgentId>,
    pub reply: ReplySlot,
}

/// Multicast, fire-and-forget.
pub(crate) struct PublishEnvelope {
    pub message: AnyMessage,
    pub sender: Option<AgentId>,
    pub topic: TopicId,
    pub token: CancellationToken,
    pub message_id: String,
}

/// Unit of work on the runtime queue.
pub(crate) enum Envelope {
    Send(SendEnvelope),
    Publish(PublishEnvelope),
}

impl Envelope {
    pub fn message_id(&self) -> &str {
        match self {
            Envelope::Send(env) => &env.message_id,
            Envelope::Publish(env) => &env.message_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Send(_) => "send",
            Envelope::Publish(_) => "publish",
        }
    }

    /// Fail the envelope without delivering it. Senders get `err`; a
    /// publish has nobody waiting on it.
    pub fn reject(self, err: RuntimeError) {
        if let Envelope::Send(env) = self {
            let _ = env.reply.send(Err(err));
        }
    }
}

/// New message id.
pub(crate) fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
