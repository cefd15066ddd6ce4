//! Per-agent-type handler tables and most-specific-match dispatch.
//!
//! A [`Router`] is built once per routed agent type (see
//! [`RoutedAgent::routes`](crate::RoutedAgent::routes)) and shared by every
//! instance of that type. Each entry maps a message type name to a typed
//! [`Handler`] implementation on the agent.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::agent::AgentId;
use crate::message::{AnyMessage, MessageType};
use crate::{MessageContext, Result, RuntimeError};

/// What a handler sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Fire-and-forget; valid for both send and publish.
    None,
    /// Replies with the named message type; valid for send only.
    Message(&'static str),
}

/// Return type of a [`Handler`]: `()` or any [`MessageType`].
pub trait IntoReply: Send + 'static {
    const KIND: ReplyKind;

    fn into_reply(self) -> Option<AnyMessage>;
}

impl IntoReply for () {
    const KIND: ReplyKind = ReplyKind::None;

    fn into_reply(self) -> Option<AnyMessage> {
        None
    }
}

impl<T: MessageType> IntoReply for T {
    const KIND: ReplyKind = ReplyKind::Message(T::TYPE_NAME);

    fn into_reply(self) -> Option<AnyMessage> {
        Some(AnyMessage::new(self))
    }
}

/// A typed handler: exactly one accepted message type, zero or one reply
/// type.
#[async_trait]
pub trait Handler<M: MessageType>: Send + Sync {
    type Reply: IntoReply;

    async fn handle(&mut self, message: M, ctx: &MessageContext) -> Result<Self::Reply>;
}

trait Route<A>: Send + Sync {
    fn reply_kind(&self) -> ReplyKind;

    fn call<'a>(
        &'a self,
        agent: &'a mut A,
        message: &'a AnyMessage,
        ctx: &'a MessageContext,
    ) -> BoxFuture<'a, Result<Option<AnyMessage>>>;
}

struct TypedRoute<M>(PhantomData<fn() -> M>);

impl<A, M> Route<A> for TypedRoute<M>
where
    A: Handler<M> + 'static,
    M: MessageType,
{
    fn reply_kind(&self) -> ReplyKind {
        <A::Reply as IntoReply>::KIND
    }

    fn call<'a>(
        &'a self,
        agent: &'a mut A,
        message: &'a AnyMessage,
        ctx: &'a MessageContext,
    ) -> BoxFuture<'a, Result<Option<AnyMessage>>> {
        Box::pin(async move {
            let view = message
                .view::<M>()
                .cloned()
                .ok_or_else(|| RuntimeError::CantHandle {
                    agent: ctx.recipient().clone(),
                    message_type: message.type_name().to_string(),
                    reason: format!("payload has no {} view", M::TYPE_NAME),
                })?;
            let reply = agent.handle(view, ctx).await?;
            Ok(reply.into_reply())
        })
    }
}

/// Handler table for agent type `A`.
///
/// ```
/// use weft_core::{Handler, MessageContext, MessageType, Result, RoutedAgent, Router};
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Ping;
/// impl MessageType for Ping { const TYPE_NAME: &'static str = "Ping"; }
///
/// struct Pinger;
///
/// #[async_trait::async_trait]
/// impl Handler<Ping> for Pinger {
///     type Reply = Ping;
///     async fn handle(&mut self, msg: Ping, _ctx: &MessageContext) -> Result<Ping> {
///         Ok(msg)
///     }
/// }
///
/// impl RoutedAgent for Pinger {
///     fn routes() -> Router<Self> {
///         Router::new().route::<Ping>()
///     }
/// }
///
/// assert!(Pinger::routes().handles("Ping"));
/// ```
pub struct Router<A> {
    routes: HashMap<&'static str, Arc<dyn Route<A>>>,
    duplicates: Vec<&'static str>,
}

impl<A: Send + Sync + 'static> Router<A> {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Route messages of type `M` (and, failing a closer match, messages
    /// that declare `M` as an ancestor) to `A`'s `Handler<M>`.
    pub fn route<M>(mut self) -> Self
    where
        A: Handler<M>,
        M: MessageType,
    {
        let route: Arc<dyn Route<A>> = Arc::new(TypedRoute::<M>(PhantomData));
        if self.routes.insert(M::TYPE_NAME, route).is_some() {
            self.duplicates.push(M::TYPE_NAME);
        }
        self
    }

    pub fn handles(&self, type_name: &str) -> bool {
        self.routes.contains_key(type_name)
    }

    pub fn reply_kind(&self, type_name: &str) -> Option<ReplyKind> {
        self.routes.get(type_name).map(|route| route.reply_kind())
    }

    /// Declared message types, sorted.
    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.routes.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Reject tables that declared the same message type twice.
    pub fn validate(&self, agent_type: &str) -> Result<()> {
        match self.duplicates.first() {
            Some(message_type) => Err(RuntimeError::DuplicateHandler {
                agent_type: agent_type.to_string(),
                message_type: message_type.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Name of the handler type that wins for `message`: the declared type
    /// closest to the payload's runtime type. A tie at that distance between
    /// two different types is ambiguous.
    pub fn select(&self, message: &AnyMessage, agent: &AgentId) -> Result<&'static str> {
        let mut best: Option<(usize, Vec<&'static str>)> = None;
        for ancestor in message.lineage() {
            let type_name = ancestor.type_name();
            if !self.routes.contains_key(type_name) {
                continue;
            }
            let depth = ancestor.depth();
            let closer = best.as_ref().map_or(true, |(best_depth, _)| depth < *best_depth);
            if closer {
                best = Some((depth, vec![type_name]));
            } else if let Some((best_depth, names)) = best.as_mut() {
                if depth == *best_depth && !names.contains(&type_name) {
                    names.push(type_name);
                }
            }
        }

        match best {
            Some((_, names)) if names.len() == 1 => Ok(names[0]),
            Some((depth, names)) => Err(RuntimeError::CantHandle {
                agent: agent.clone(),
                message_type: message.type_name().to_string(),
                reason: format!(
                    "ambiguous handlers at distance {}: {}",
                    depth,
                    names.join(", ")
                ),
            }),
            None => Err(RuntimeError::CantHandle {
                agent: agent.clone(),
                message_type: message.type_name().to_string(),
                reason: "no matching handler".to_string(),
            }),
        }
    }

    /// Run the selected handler for one delivery.
    pub async fn dispatch(
        &self,
        agent: &mut A,
        message: AnyMessage,
        ctx: MessageContext,
    ) -> Result<Option<AnyMessage>> {
        let selected = self.select(&message, ctx.recipient())?;
        let route = self.routes.get(selected).ok_or_else(|| RuntimeError::CantHandle {
            agent: ctx.recipient().clone(),
            message_type: message.type_name().to_string(),
            reason: "no matching handler".to_string(),
        })?;

        if !ctx.is_rpc() && route.reply_kind() != ReplyKind::None {
            warn!(
                target: "runtime",
                agent_id = %ctx.recipient(),
                message_type = message.type_name(),
                handler = selected,
                "Reply-declaring handler reached by publish"
            );
            return Err(RuntimeError::ReplyOnPublish {
                agent: ctx.recipient().clone(),
                message_type: message.type_name().to_string(),
            });
        }

        debug!(
            target: "runtime",
            agent_id = %ctx.recipient(),
            message_type = message.type_name(),
            handler = selected,
            "Dispatching"
        );
        route.call(agent, &message, &ctx).await
    }
}

impl<A: Send + Sync + 'static> Default for Router<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Router<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&&'static str> = self.routes.keys().collect();
        types.sort();
        f.debug_struct("Router").field("routes", &types).finish()
    }
}
