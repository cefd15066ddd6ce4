//! Publish fan-out: three subscriber types, two sources.

use super::*;

#[tokio::test]
async fn test_e2e_news_fan_out_per_source() {
    let rt = runtime();
    let log: Log = Default::default();
    for agent_type in ["reader", "archiver", "notifier"] {
        register_recorder(&rt, agent_type, &log);
    }

    rt.publish(
        NewsItem {
            headline: "rain".into(),
        },
        TopicId::new("news", "room1"),
    )
    .await
    .unwrap();
    rt.publish(
        NewsItem {
            headline: "sun".into(),
        },
        TopicId::new("news", "room2"),
    )
    .await
    .unwrap();
    rt.run_until_idle().await.unwrap();

    let expected = vec![
        (AgentId::new("archiver", "room1"), "rain".to_string()),
        (AgentId::new("archiver", "room2"), "sun".to_string()),
        (AgentId::new("notifier", "room1"), "rain".to_string()),
        (AgentId::new("notifier", "room2"), "sun".to_string()),
        (AgentId::new("reader", "room1"), "rain".to_string()),
        (AgentId::new("reader", "room2"), "sun".to_string()),
    ];
    assert_eq!(entries(&log), expected);
    assert_eq!(rt.registry().instance_ids().len(), 6);
}

#[tokio::test]
async fn test_e2e_news_unmatched_topic_reaches_nobody() {
    let rt = runtime();
    let log: Log = Default::default();
    register_recorder(&rt, "reader", &log);

    rt.publish(
        NewsItem {
            headline: "lost".into(),
        },
        TopicId::new("sports", "room1"),
    )
    .await
    .unwrap();
    rt.run_until_idle().await.unwrap();

    assert!(entries(&log).is_empty());
    assert!(rt.registry().instance_ids().is_empty());
}

#[tokio::test]
async fn test_e2e_news_removed_subscription_stops_delivery() {
    let rt = runtime();
    let log: Log = Default::default();
    register_recorder(&rt, "reader", &log);
    let extra = TypeSubscription::new("news", "reader").with_id("second");
    rt.add_subscription(Arc::new(extra)).await.unwrap();

    let topic = TopicId::new("news", "room1");
    rt.publish(NewsItem { headline: "one".into() }, topic.clone())
        .await
        .unwrap();
    rt.run_until_idle().await.unwrap();
    // Two rules resolve to the same agent: still delivered once.
    assert_eq!(entries(&log).len(), 1);

    for id in rt.subscriptions().ids() {
        rt.remove_subscription(&id).await.unwrap();
    }
    rt.publish(NewsItem { headline: "two".into() }, topic)
        .await
        .unwrap();
    rt.run_until_idle().await.unwrap();
    assert_eq!(entries(&log).len(), 1);
}

/// Fails on every news item.
struct Jammed;

#[async_trait]
impl Handler<NewsItem> for Jammed {
    type Reply = ();

    async fn handle(&mut self, _message: NewsItem, _ctx: &MessageContext) -> Result<()> {
        Err(RuntimeError::handler("press jammed"))
    }
}

impl RoutedAgent for Jammed {
    fn routes() -> Router<Self> {
        Router::new().route::<NewsItem>()
    }
}

#[tokio::test]
async fn test_e2e_news_failing_subscriber_does_not_block_others() {
    let rt = runtime();
    let log: Log = Default::default();
    let subscription: Arc<dyn Subscription> = Arc::new(TypeSubscription::new("news", "press"));
    rt.register("press", |_| Ok(Jammed), vec![subscription])
        .unwrap();
    register_recorder(&rt, "reader", &log);

    rt.publish(
        NewsItem {
            headline: "storm".into(),
        },
        TopicId::new("news", "room1"),
    )
    .await
    .unwrap();

    let err = rt.run_until_idle().await.unwrap_err();
    assert_eq!(err, RuntimeError::handler("press jammed"));
    assert_eq!(
        entries(&log),
        vec![(AgentId::new("reader", "room1"), "storm".to_string())]
    );
    assert_eq!(rt.stats().failed, 1);
}
