//! Agent runtime.
//! - context.rs: MessageContext handed to every handler
//! - queue.rs: FIFO envelope queue with in-flight accounting
//! - worker.rs: per-agent mailbox tasks
//! - intervention.rs: send/publish/response hooks
//! - single_threaded.rs: the in-process runtime

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::AgentId;
use crate::subscription::Subscription;
use crate::{AnyMessage, CancellationToken, Result, TopicId};

mod context;
mod intervention;
mod queue;
mod single_threaded;
mod worker;

pub use context::MessageContext;
pub use intervention::{Intervention, InterventionHandler};
pub use single_threaded::SingleThreadedRuntime;

/// Object-safe runtime contract. Implemented by [`SingleThreadedRuntime`];
/// a distributed transport implements the same surface.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Deliver `message` to `recipient` and wait for its reply.
    async fn send_message(
        &self,
        message: AnyMessage,
        recipient: AgentId,
        options: SendOptions,
    ) -> Result<Option<AnyMessage>>;

    /// Deliver `message` to every subscriber of `topic`. Returns once the
    /// message is queued.
    async fn publish_message(
        &self,
        message: AnyMessage,
        topic: TopicId,
        options: PublishOptions,
    ) -> Result<()>;

    async fn add_subscription(&self, subscription: Arc<dyn Subscription>) -> Result<()>;

    async fn remove_subscription(&self, id: &str) -> Result<()>;

    async fn agent_save_state(&self, agent: &AgentId) -> Result<serde_json::Value>;

    async fn agent_load_state(&self, agent: &AgentId, state: serde_json::Value) -> Result<()>;
}

/// Per-call options for [`AgentRuntime::send_message`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub sender: Option<AgentId>,
    pub cancellation_token: Option<CancellationToken>,
    pub message_id: Option<String>,
    /// Agents already waiting on a reply further up this call.
    pub call_chain: Vec<AgentId>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: AgentId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Per-call options for [`AgentRuntime::publish_message`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub sender: Option<AgentId>,
    pub cancellation_token: Option<CancellationToken>,
    pub message_id: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: AgentId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}
