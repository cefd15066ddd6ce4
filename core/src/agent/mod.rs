//! Agents and the registry that instantiates them.
//! - id.rs: AgentId and agent type naming rules
//! - registry.rs: factory table and lazily populated instance table
//! - routed.rs: RoutedAgent, typed handlers dispatched through a Router

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use crate::{AnyMessage, MessageContext, Result};

mod id;
mod registry;
mod routed;

pub use id::{is_valid_agent_type, AgentId};
pub use registry::{AgentFactory, AgentRegistry, InstantiationContext};
pub use routed::RoutedAgent;
pub(crate) use routed::RoutedInstance;

/// Agent behavior trait.
///
/// Most agents implement [`RoutedAgent`] instead and get `on_message` from
/// their router; implement this directly for agents that want to inspect
/// every payload themselves.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Handle one delivery. `Ok(Some(reply))` completes the sender's pending
    /// call; returning a reply for a published message is a configuration
    /// error.
    async fn on_message(
        &mut self,
        message: AnyMessage,
        ctx: MessageContext,
    ) -> Result<Option<AnyMessage>>;

    async fn save_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Object(Default::default()))
    }

    async fn load_state(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Called once when the runtime is closed.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// The concrete agent, for introspection through [`AgentRef::inspect`].
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a live agent instance.
///
/// Handles to the same `AgentId` always point at the same instance;
/// [`AgentRef::ptr_eq`] tells them apart.
#[derive(Clone)]
pub struct AgentRef {
    id: AgentId,
    cell: Arc<Mutex<Box<dyn Agent>>>,
}

impl AgentRef {
    pub(crate) fn new(id: AgentId, agent: Box<dyn Agent>) -> Self {
        Self {
            id,
            cell: Arc::new(Mutex::new(agent)),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn ptr_eq(&self, other: &AgentRef) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Exclusive access; waits behind any handler currently running.
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn Agent>> {
        self.cell.lock().await
    }

    /// Run `f` against the concrete agent type `A`. `None` if the instance
    /// is not an `A`.
    pub async fn inspect<A, R, F>(&self, f: F) -> Option<R>
    where
        A: 'static,
        F: FnOnce(&A) -> R,
    {
        let guard = self.cell.lock().await;
        let agent: &dyn Agent = &**guard;
        agent.as_any().downcast_ref::<A>().map(f)
    }
}

impl fmt::Debug for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRef").field("id", &self.id).finish()
    }
}
