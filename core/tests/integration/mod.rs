//! Integration Test Module
//!
//! End-to-end scenarios for weft-core, run against a real
//! `SingleThreadedRuntime`:
//!
//! - `e2e_echo`: request/response through a running runtime
//! - `e2e_news`: topic fan-out across sources
//! - `e2e_nested`: handlers that send and publish from inside a delivery

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

pub use weft_core::{
    AgentId, AgentRuntime, Handler, MessageContext, MessageType, Result, RoutedAgent, Router,
    RuntimeConfig, RuntimeError, SingleThreadedRuntime, Subscription, TopicId, TypeSubscription,
};

mod e2e_echo;
mod e2e_nested;
mod e2e_news;

// =============================================================================
// Shared Messages
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct Echo(pub String);

impl MessageType for Echo {
    const TYPE_NAME: &'static str = "Echo";
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewsItem {
    pub headline: String,
}

impl MessageType for NewsItem {
    const TYPE_NAME: &'static str = "NewsItem";
}

// =============================================================================
// Shared Agents
// =============================================================================

/// Replies with the message it got.
pub struct EchoAgent;

#[async_trait]
impl Handler<Echo> for EchoAgent {
    type Reply = Echo;

    async fn handle(&mut self, message: Echo, _ctx: &MessageContext) -> Result<Echo> {
        Ok(message)
    }
}

impl RoutedAgent for EchoAgent {
    fn routes() -> Router<Self> {
        Router::new().route::<Echo>()
    }
}

pub type Log = Arc<Mutex<Vec<(AgentId, String)>>>;

/// Appends every news item it receives, tagged with its own id.
pub struct Recorder {
    pub log: Log,
}

#[async_trait]
impl Handler<NewsItem> for Recorder {
    type Reply = ();

    async fn handle(&mut self, message: NewsItem, ctx: &MessageContext) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push((ctx.recipient().clone(), message.headline));
        Ok(())
    }
}

impl RoutedAgent for Recorder {
    fn routes() -> Router<Self> {
        Router::new().route::<NewsItem>()
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn runtime() -> SingleThreadedRuntime {
    SingleThreadedRuntime::new(RuntimeConfig::default().with_ignore_unhandled_errors(false))
}

pub fn register_echo(rt: &SingleThreadedRuntime) {
    rt.register("echo", |_| Ok(EchoAgent), vec![]).unwrap();
}

/// Register `agent_type` as a news recorder subscribed to the `news` topic
/// type.
pub fn register_recorder(rt: &SingleThreadedRuntime, agent_type: &str, log: &Log) {
    let log = Arc::clone(log);
    let subscription: Arc<dyn Subscription> = Arc::new(TypeSubscription::new("news", agent_type));
    rt.register(
        agent_type,
        move |_| {
            Ok(Recorder {
                log: Arc::clone(&log),
            })
        },
        vec![subscription],
    )
    .unwrap();
}

pub fn entries(log: &Log) -> Vec<(AgentId, String)> {
    let mut entries = log.lock().unwrap().clone();
    entries.sort();
    entries
}
