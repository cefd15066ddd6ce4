use async_trait::async_trait;

use crate::agent::AgentId;
use crate::{AnyMessage, TopicId};

/// Outcome of an intervention hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Intervention {
    /// Continue with this (possibly rewritten) message.
    Pass(AnyMessage),
    /// Stop here. A dropped send or reply fails the waiting sender with
    /// `MessageDropped`; a dropped publish is discarded.
    Drop,
}

/// Hooks run on every send, publish and reply before it moves on. Handlers
/// run in registration order; the first `Drop` wins.
#[async_trait]
pub trait InterventionHandler: Send + Sync {
    async fn on_send(
        &self,
        message: AnyMessage,
        _sender: Option<&AgentId>,
        _recipient: &AgentId,
    ) -> Intervention {
        Intervention::Pass(message)
    }

    async fn on_publish(
        &self,
        message: AnyMessage,
        _sender: Option<&AgentId>,
        _topic: &TopicId,
    ) -> Intervention {
        Intervention::Pass(message)
    }

    async fn on_response(
        &self,
        message: AnyMessage,
        _sender: &AgentId,
        _recipient: Option<&AgentId>,
    ) -> Intervention {
        Intervention::Pass(message)
    }
}
