use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use super::Agent;
use crate::router::Router;
use crate::{AnyMessage, MessageContext, Result};

/// An agent whose messages are dispatched to typed
/// [`Handler`](crate::Handler) implementations.
///
/// The router is built once at registration and shared by all instances.
#[async_trait]
pub trait RoutedAgent: Send + Sync + Sized + 'static {
    fn routes() -> Router<Self>;

    async fn save_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Object(Default::default()))
    }

    async fn load_state(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct RoutedInstance<A> {
    agent: A,
    router: Arc<Router<A>>,
}

impl<A: RoutedAgent> RoutedInstance<A> {
    pub(crate) fn new(agent: A, router: Arc<Router<A>>) -> Self {
        Self { agent, router }
    }
}

#[async_trait]
impl<A: RoutedAgent> Agent for RoutedInstance<A> {
    async fn on_message(
        &mut self,
        message: AnyMessage,
        ctx: MessageContext,
    ) -> Result<Option<AnyMessage>> {
        let router = Arc::clone(&self.router);
        router.dispatch(&mut self.agent, message, ctx).await
    }

    async fn save_state(&self) -> Result<serde_json::Value> {
        self.agent.save_state().await
    }

    async fn load_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.agent.load_state(state).await
    }

    async fn close(&mut self) -> Result<()> {
        self.agent.close().await
    }

    fn as_any(&self) -> &dyn Any {
        &self.agent
    }
}
