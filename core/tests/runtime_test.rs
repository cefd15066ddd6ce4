use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use weft_core::{
    Agent, AgentFactory, AgentId, AnyMessage, Handler, InstantiationContext, Intervention,
    InterventionHandler, MessageContext, MessageType, Result, RoutedAgent, Router, RuntimeConfig,
    RuntimeError, SingleThreadedRuntime, TopicId, TypeSubscription,
};

#[derive(Clone, Debug, PartialEq)]
struct Add(u64);

impl MessageType for Add {
    const TYPE_NAME: &'static str = "Add";
}

#[derive(Clone, Debug, PartialEq)]
struct Total(u64);

impl MessageType for Total {
    const TYPE_NAME: &'static str = "Total";
}

#[derive(Default)]
struct Counter {
    count: u64,
    closed: Option<Arc<AtomicBool>>,
}

#[async_trait]
impl Handler<Add> for Counter {
    type Reply = Total;

    async fn handle(&mut self, message: Add, _ctx: &MessageContext) -> Result<Total> {
        self.count += message.0;
        Ok(Total(self.count))
    }
}

#[async_trait]
impl RoutedAgent for Counter {
    fn routes() -> Router<Self> {
        Router::new().route::<Add>()
    }

    async fn save_state(&self) -> Result<serde_json::Value> {
        Ok(json!({ "count": self.count }))
    }

    async fn load_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.count = state["count"]
            .as_u64()
            .ok_or_else(|| RuntimeError::handler("missing count"))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(flag) = &self.closed {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn runtime() -> SingleThreadedRuntime {
    SingleThreadedRuntime::new(RuntimeConfig::default().with_ignore_unhandled_errors(false))
}

fn with_counter() -> SingleThreadedRuntime {
    let rt = runtime();
    rt.register("counter", |_| Ok(Counter::default()), vec![])
        .unwrap();
    rt
}

async fn wait_until_queued(rt: &SingleThreadedRuntime, n: u64) {
    while rt.stats().queued < n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_instance_is_singleton_per_agent_id() {
    let rt = with_counter();
    let id = AgentId::new("counter", "a");

    let first = rt.get_agent_instance(&id).unwrap();
    let second = rt.get_agent_instance(&id).unwrap();
    assert!(first.ptr_eq(&second));

    let other = rt.get_agent_instance(&AgentId::new("counter", "b")).unwrap();
    assert!(!first.ptr_eq(&other));
}

#[tokio::test]
async fn test_state_persists_across_sends() {
    let rt = with_counter();
    rt.start().unwrap();
    let id = AgentId::new("counter", "a");

    rt.send(Add(2), id.clone()).await.unwrap();
    let total = rt.send_expect::<Total>(Add(3), id.clone()).await.unwrap();
    assert_eq!(total, Total(5));

    let count = rt
        .get_agent_instance(&id)
        .unwrap()
        .inspect(|c: &Counter| c.count)
        .await;
    assert_eq!(count, Some(5));
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn test_registration_errors() {
    let rt = with_counter();
    let err = rt
        .register("counter", |_| Ok(Counter::default()), vec![])
        .unwrap_err();
    assert_eq!(err, RuntimeError::DuplicateRegistration("counter".into()));

    let err = rt
        .register("bad name", |_| Ok(Counter::default()), vec![])
        .unwrap_err();
    assert_eq!(err, RuntimeError::InvalidAgentType("bad name".into()));

    assert_eq!(rt.registry().agent_types(), vec!["counter".to_string()]);
}

#[tokio::test]
async fn test_unknown_agent_type_fails_the_send() {
    let rt = with_counter();
    rt.start().unwrap();
    let err = rt
        .send(Add(1), AgentId::new("ghost", "x"))
        .await
        .unwrap_err();
    assert_eq!(err, RuntimeError::UnknownAgentType("ghost".into()));
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn test_unexpected_reply_type() {
    let rt = with_counter();
    rt.start().unwrap();
    let err = rt
        .send_expect::<Add>(Add(1), AgentId::new("counter", "a"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RuntimeError::UnexpectedReply {
            expected: "Add".into(),
            actual: "Total".into(),
        }
    );
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_after_stop_fails() {
    let rt = with_counter();
    rt.start().unwrap();
    rt.stop().await.unwrap();

    let err = rt
        .send(Add(1), AgentId::new("counter", "a"))
        .await
        .unwrap_err();
    assert_eq!(err, RuntimeError::RuntimeStopped);
    let err = rt
        .publish(Add(1), TopicId::new("t", "s"))
        .await
        .unwrap_err();
    assert_eq!(err, RuntimeError::RuntimeStopped);
    assert!(rt.is_stopped());
}

#[tokio::test]
async fn test_stop_fails_queued_senders() {
    let rt = with_counter();
    let pending = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.send(Add(1), AgentId::new("counter", "a")).await })
    };
    wait_until_queued(&rt, 1).await;

    rt.stop().await.unwrap();
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, RuntimeError::RuntimeStopped);
    assert!(rt.registry().instance_ids().is_empty());
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let rt = with_counter();
    rt.start().unwrap();
    assert_eq!(rt.start().unwrap_err(), RuntimeError::AlreadyRunning);
    assert_eq!(rt.process_next().await.unwrap_err(), RuntimeError::AlreadyRunning);
    rt.stop().await.unwrap();

    // A stopped runtime can be started again.
    rt.start().unwrap();
    let total = rt
        .send_expect::<Total>(Add(4), AgentId::new("counter", "a"))
        .await
        .unwrap();
    assert_eq!(total, Total(4));
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn test_process_next_handles_one_envelope() {
    let rt = with_counter();
    assert!(!rt.process_next().await.unwrap());

    let (reply, processed) = tokio::join!(
        rt.send_expect::<Total>(Add(7), AgentId::new("counter", "a")),
        rt.process_next()
    );
    assert_eq!(reply.unwrap(), Total(7));
    assert!(processed.unwrap());
}

#[tokio::test]
async fn test_published_failure_surfaces_from_run_until_idle() {
    let rt = with_counter();
    rt.add_subscription_rule("sums", "counter");

    // Counter's Add handler replies, which is not allowed for published
    // deliveries.
    rt.publish(Add(1), TopicId::new("sums", "a")).await.unwrap();
    let err = rt.run_until_idle().await.unwrap_err();
    assert_eq!(
        err,
        RuntimeError::ReplyOnPublish {
            agent: AgentId::new("counter", "a"),
            message_type: "Add".into(),
        }
    );
    // Reported once.
    rt.run_until_idle().await.unwrap();
}

#[tokio::test]
async fn test_published_failure_ignored_by_default() {
    assert!(RuntimeConfig::default().ignore_unhandled_errors);
    let rt = SingleThreadedRuntime::default();
    rt.register("counter", |_| Ok(Counter::default()), vec![])
        .unwrap();
    rt.add_subscription_rule("sums", "counter");

    rt.publish(Add(1), TopicId::new("sums", "a")).await.unwrap();
    rt.run_until_idle().await.unwrap();
    assert_eq!(rt.stats().failed, 1);
}

#[tokio::test]
async fn test_save_and_load_state() {
    let rt = with_counter();
    rt.start().unwrap();
    rt.send(Add(3), AgentId::new("counter", "a")).await.unwrap();
    rt.send(Add(9), AgentId::new("counter", "b")).await.unwrap();
    rt.stop().await.unwrap();

    let saved = rt.save_state().await.unwrap();
    assert_eq!(saved["counter/a"], json!({ "count": 3 }));
    assert_eq!(saved["counter/b"], json!({ "count": 9 }));

    let restored = with_counter();
    restored.load_state(saved).await.unwrap();
    let count = restored
        .get_agent_instance(&AgentId::new("counter", "b"))
        .unwrap()
        .inspect(|c: &Counter| c.count)
        .await;
    assert_eq!(count, Some(9));
}

#[tokio::test]
async fn test_close_runs_agent_close_hooks() {
    let rt = runtime();
    let closed = Arc::new(AtomicBool::new(false));
    {
        let closed = Arc::clone(&closed);
        rt.register(
            "counter",
            move |_| {
                Ok(Counter {
                    count: 0,
                    closed: Some(Arc::clone(&closed)),
                })
            },
            vec![],
        )
        .unwrap();
    }
    rt.start().unwrap();
    rt.send(Add(1), AgentId::new("counter", "a")).await.unwrap();

    rt.close().await.unwrap();
    assert!(closed.load(Ordering::SeqCst));
    assert!(rt.registry().instance_ids().is_empty());
}

/// Drops sends of `Add(0)` and doubles every `Total` reply.
struct Doubler;

#[async_trait]
impl InterventionHandler for Doubler {
    async fn on_send(
        &self,
        message: AnyMessage,
        _sender: Option<&AgentId>,
        _recipient: &AgentId,
    ) -> Intervention {
        match message.downcast_ref::<Add>() {
            Some(Add(0)) => Intervention::Drop,
            _ => Intervention::Pass(message),
        }
    }

    async fn on_response(
        &self,
        message: AnyMessage,
        _sender: &AgentId,
        _recipient: Option<&AgentId>,
    ) -> Intervention {
        match message.downcast::<Total>() {
            Some(Total(n)) => Intervention::Pass(Total(n * 2).into()),
            None => Intervention::Pass(message),
        }
    }
}

#[tokio::test]
async fn test_interventions_rewrite_and_drop() {
    let rt = with_counter();
    rt.add_intervention(Arc::new(Doubler));
    rt.start().unwrap();
    let id = AgentId::new("counter", "a");

    let err = rt.send(Add(0), id.clone()).await.unwrap_err();
    assert_eq!(err, RuntimeError::MessageDropped);

    let total = rt.send_expect::<Total>(Add(5), id).await.unwrap();
    assert_eq!(total, Total(10));
    rt.stop().await.unwrap();
    assert_eq!(rt.stats().dropped, 1);
}

/// Implements `Agent` directly and panics on demand.
struct Fragile {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for Fragile {
    async fn on_message(
        &mut self,
        message: AnyMessage,
        _ctx: MessageContext,
    ) -> Result<Option<AnyMessage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if message.downcast_ref::<Add>() == Some(&Add(0)) {
            panic!("zero");
        }
        Ok(Some(message))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[tokio::test]
async fn test_handler_panic_is_reported_and_agent_survives() {
    let rt = runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let factory: AgentFactory = {
        let calls = Arc::clone(&calls);
        Arc::new(move |_: &InstantiationContext| {
            Ok(Box::new(Fragile {
                calls: Arc::clone(&calls),
            }) as Box<dyn Agent>)
        })
    };
    rt.register_factory("fragile", factory, vec![]).unwrap();
    rt.start().unwrap();
    let id = AgentId::new("fragile", "a");

    let err = rt.send(Add(0), id.clone()).await.unwrap_err();
    assert_eq!(err, RuntimeError::Handler("handler panicked".into()));

    let reply = rt.send(Add(1), id).await.unwrap();
    assert_eq!(reply, Some(AnyMessage::new(Add(1))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_when_idle_drains_background_work() {
    let rt = with_counter();
    rt.start().unwrap();
    let pending = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.send(Add(1), AgentId::new("counter", "a")).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    rt.stop_when_idle().await.unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), Some(AnyMessage::new(Total(1))));
}

trait SubscriptionRules {
    fn add_subscription_rule(&self, topic_type: &str, agent_type: &str);
}

impl SubscriptionRules for SingleThreadedRuntime {
    fn add_subscription_rule(&self, topic_type: &str, agent_type: &str) {
        self.subscriptions()
            .add(Arc::new(TypeSubscription::new(topic_type, agent_type)))
            .unwrap();
    }
}

/// Raises its flag when dropped.
struct Tracked {
    dropped: Arc<AtomicBool>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Handler<Add> for Tracked {
    type Reply = ();

    async fn handle(&mut self, _message: Add, _ctx: &MessageContext) -> Result<()> {
        Ok(())
    }
}

impl RoutedAgent for Tracked {
    fn routes() -> Router<Self> {
        Router::new().route::<Add>()
    }
}

#[tokio::test]
async fn test_dropping_runtime_releases_agents() {
    let dropped = Arc::new(AtomicBool::new(false));
    let rt = runtime();
    {
        let dropped = Arc::clone(&dropped);
        rt.register(
            "tracked",
            move |_| {
                Ok(Tracked {
                    dropped: Arc::clone(&dropped),
                })
            },
            vec![],
        )
        .unwrap();
    }
    rt.start().unwrap();
    rt.send(Add(1), AgentId::new("tracked", "a")).await.unwrap();
    rt.stop().await.unwrap();
    drop(rt);

    tokio::time::timeout(Duration::from_secs(1), async {
        while !dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("agent outlived its runtime");
}

#[tokio::test]
async fn test_dropping_running_runtime_ends_run_loop() {
    let dropped = Arc::new(AtomicBool::new(false));
    let rt = runtime();
    {
        let dropped = Arc::clone(&dropped);
        rt.register(
            "tracked",
            move |_| {
                Ok(Tracked {
                    dropped: Arc::clone(&dropped),
                })
            },
            vec![],
        )
        .unwrap();
    }
    rt.start().unwrap();
    rt.send(Add(1), AgentId::new("tracked", "a")).await.unwrap();
    drop(rt);

    tokio::time::timeout(Duration::from_secs(1), async {
        while !dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("running runtime was never released");
}
