//! Handlers that call back into the runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::*;

#[derive(Clone, Debug, PartialEq)]
struct Greet(String);

impl MessageType for Greet {
    const TYPE_NAME: &'static str = "Greet";
}

/// Asks the echo agent with the same key to repeat a greeting.
struct Greeter;

#[async_trait]
impl Handler<Greet> for Greeter {
    type Reply = Echo;

    async fn handle(&mut self, message: Greet, ctx: &MessageContext) -> Result<Echo> {
        let key = ctx.recipient().key().to_string();
        let echoed = ctx
            .send_expect::<Echo>(Echo(format!("hello {}", message.0)), AgentId::new("echo", key))
            .await?;
        Ok(Echo(echoed.0.to_uppercase()))
    }
}

impl RoutedAgent for Greeter {
    fn routes() -> Router<Self> {
        Router::new().route::<Greet>()
    }
}

#[tokio::test]
async fn test_e2e_nested_send_completes_outer_call() {
    let rt = runtime();
    register_echo(&rt);
    rt.register("greeter", |_| Ok(Greeter), vec![]).unwrap();
    rt.start().unwrap();

    let reply = rt
        .send_expect::<Echo>(Greet("ada".into()), AgentId::new("greeter", "k"))
        .await
        .unwrap();
    assert_eq!(reply, Echo("HELLO ADA".into()));
    assert!(rt
        .registry()
        .instance_ids()
        .contains(&AgentId::new("echo", "k")));
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn test_e2e_nested_process_next_runs_triggered_envelopes() {
    let rt = runtime();
    register_echo(&rt);
    rt.register("greeter", |_| Ok(Greeter), vec![]).unwrap();

    let (reply, processed) = tokio::join!(
        rt.send_expect::<Echo>(Greet("bo".into()), AgentId::new("greeter", "k")),
        rt.process_next()
    );
    assert_eq!(reply.unwrap(), Echo("HELLO BO".into()));
    assert!(processed.unwrap());
    assert!(!rt.process_next().await.unwrap());
}

/// Sends to itself from inside its own handler.
struct Narcissist;

#[async_trait]
impl Handler<Echo> for Narcissist {
    type Reply = Echo;

    async fn handle(&mut self, message: Echo, ctx: &MessageContext) -> Result<Echo> {
        let me = ctx.recipient().clone();
        ctx.send_expect::<Echo>(message, me).await
    }
}

impl RoutedAgent for Narcissist {
    fn routes() -> Router<Self> {
        Router::new().route::<Echo>()
    }
}

#[tokio::test]
async fn test_e2e_nested_self_send_fails_fast() {
    let rt = runtime();
    rt.register("narcissist", |_| Ok(Narcissist), vec![])
        .unwrap();
    rt.start().unwrap();

    let id = AgentId::new("narcissist", "k");
    let err = rt.send(Echo("me".into()), id.clone()).await.unwrap_err();
    assert_eq!(err, RuntimeError::Reentrancy(id));
    rt.stop().await.unwrap();
}

#[derive(Clone, Debug, PartialEq)]
struct Chat(String);

impl MessageType for Chat {
    const TYPE_NAME: &'static str = "Chat";
}

/// Receives a `Chat` by send, republishes it on its own room, and counts
/// chats it receives by publish.
struct Chatter {
    heard: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler<Chat> for Chatter {
    type Reply = ();

    async fn handle(&mut self, message: Chat, ctx: &MessageContext) -> Result<()> {
        if ctx.is_rpc() {
            let room = ctx.recipient().key().to_string();
            ctx.publish(message, TopicId::new("chat", room)).await
        } else {
            self.heard.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

impl RoutedAgent for Chatter {
    fn routes() -> Router<Self> {
        Router::new().route::<Chat>()
    }
}

#[tokio::test]
async fn test_e2e_nested_publisher_does_not_hear_itself() {
    let rt = runtime();
    let chatter_heard = Arc::new(AtomicUsize::new(0));
    let listener_heard = Arc::new(AtomicUsize::new(0));
    for (agent_type, heard) in [("chatter", &chatter_heard), ("listener", &listener_heard)] {
        let heard = Arc::clone(heard);
        let subscription: Arc<dyn Subscription> =
            Arc::new(TypeSubscription::new("chat", agent_type));
        rt.register(
            agent_type,
            move |_| {
                Ok(Chatter {
                    heard: Arc::clone(&heard),
                })
            },
            vec![subscription],
        )
        .unwrap();
    }
    rt.start().unwrap();

    let reply = rt
        .send(Chat("hi".into()), AgentId::new("chatter", "room1"))
        .await
        .unwrap();
    assert!(reply.is_none());
    rt.stop_when_idle().await.unwrap();

    assert_eq!(chatter_heard.load(Ordering::SeqCst), 0);
    assert_eq!(listener_heard.load(Ordering::SeqCst), 1);
}

#[derive(Clone, Debug, PartialEq)]
struct Work;

impl MessageType for Work {
    const TYPE_NAME: &'static str = "Work";
}

struct Busy {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler<Work> for Busy {
    type Reply = ();

    async fn handle(&mut self, _message: Work, _ctx: &MessageContext) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl RoutedAgent for Busy {
    fn routes() -> Router<Self> {
        Router::new().route::<Work>()
    }
}

#[tokio::test]
async fn test_e2e_nested_second_message_queues_behind_running_handler() {
    let rt = runtime();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
        rt.register(
            "busy",
            move |_| {
                Ok(Busy {
                    active: Arc::clone(&active),
                    peak: Arc::clone(&peak),
                })
            },
            vec![],
        )
        .unwrap();
    }
    rt.start().unwrap();

    let id = AgentId::new("busy", "one");
    let (a, b, c) = tokio::join!(
        rt.send(Work, id.clone()),
        rt.send(Work, id.clone()),
        rt.send(Work, id.clone())
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    rt.stop().await.unwrap();
}

#[derive(Clone, Debug, PartialEq)]
struct Kick;

impl MessageType for Kick {
    const TYPE_NAME: &'static str = "Kick";
}

/// Forwards a news item to `desk/b` when kicked.
struct Kicker;

#[async_trait]
impl Handler<Kick> for Kicker {
    type Reply = ();

    async fn handle(&mut self, _message: Kick, ctx: &MessageContext) -> Result<()> {
        ctx.send(
            NewsItem {
                headline: "nested".into(),
            },
            AgentId::new("desk", "b"),
        )
        .await?;
        Ok(())
    }
}

impl RoutedAgent for Kicker {
    fn routes() -> Router<Self> {
        Router::new().route::<Kick>()
    }
}

#[tokio::test]
async fn test_e2e_nested_process_next_keeps_per_agent_order() {
    let rt = runtime();
    let log = Log::default();
    register_recorder(&rt, "desk", &log);
    rt.register("kicker", |_| Ok(Kicker), vec![]).unwrap();

    let desk = AgentId::new("desk", "b");
    let (kicked, first, drained) = tokio::join!(
        rt.send(Kick, AgentId::new("kicker", "k")),
        rt.send(
            NewsItem {
                headline: "first".into(),
            },
            desk.clone()
        ),
        async {
            let processed = rt.process_next().await?;
            rt.run_until_idle().await?;
            Ok::<_, RuntimeError>(processed)
        }
    );
    assert!(kicked.is_ok());
    assert!(first.is_ok());
    assert!(drained.unwrap());

    let headlines: Vec<String> = log.lock().unwrap().iter().map(|(_, h)| h.clone()).collect();
    assert_eq!(headlines, vec!["first".to_string(), "nested".to_string()]);
    assert!(log.lock().unwrap().iter().all(|(id, _)| *id == desk));
}
