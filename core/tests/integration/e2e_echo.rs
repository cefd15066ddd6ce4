//! Request/response end to end.

use super::*;

#[tokio::test]
async fn test_e2e_echo_round_trip() {
    let rt = runtime();
    register_echo(&rt);
    rt.start().unwrap();

    let reply = rt
        .send_expect::<Echo>(Echo("hello".into()), AgentId::new("echo", "default"))
        .await
        .unwrap();
    assert_eq!(reply, Echo("hello".into()));

    rt.stop_when_idle().await.unwrap();
    let stats = rt.stats();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.agents, 1);
}

#[tokio::test]
async fn test_e2e_echo_keys_get_separate_instances() {
    let rt = runtime();
    register_echo(&rt);
    rt.start().unwrap();

    for key in ["a", "b", "a"] {
        rt.send(Echo(key.into()), AgentId::new("echo", key))
            .await
            .unwrap();
    }

    assert_eq!(
        rt.registry().instance_ids(),
        vec![AgentId::new("echo", "a"), AgentId::new("echo", "b")]
    );
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn test_e2e_echo_through_trait_object() {
    let rt = runtime();
    register_echo(&rt);
    rt.start().unwrap();

    let handle: Arc<dyn AgentRuntime> = Arc::new(rt.clone());
    let reply = handle
        .send_message(
            Echo("via trait".into()).into(),
            AgentId::new("echo", "default"),
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        reply.and_then(|m| m.downcast::<Echo>()),
        Some(Echo("via trait".into()))
    );
    rt.stop().await.unwrap();
}
