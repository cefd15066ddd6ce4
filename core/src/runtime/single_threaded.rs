use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::expect_reply;
use super::queue::{Popped, Scheduler, Ticket};
use super::worker::{Delivery, Mailbox, Outcome};
use super::{
    AgentRuntime, Intervention, InterventionHandler, MessageContext, PublishOptions, SendOptions,
};
use crate::agent::{
    Agent, AgentFactory, AgentId, AgentRef, AgentRegistry, InstantiationContext, RoutedAgent,
    RoutedInstance,
};
use crate::envelope::{new_message_id, Envelope, PublishEnvelope, SendEnvelope};
use crate::message::MessageType;
use crate::serialization::SerializationRegistry;
use crate::stats::{RuntimeStats, StatsSnapshot};
use crate::subscription::{Subscription, SubscriptionManager};
use crate::{AnyMessage, Result, RuntimeConfig, RuntimeError, TopicId};

struct RunLoop {
    stop: tokio_util::sync::CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: RuntimeConfig,
    registry: AgentRegistry,
    subscriptions: SubscriptionManager,
    serializers: SerializationRegistry,
    scheduler: Arc<Scheduler>,
    workers: DashMap<AgentId, Mailbox>,
    interventions: RwLock<Vec<Arc<dyn InterventionHandler>>>,
    stats: RuntimeStats,
    unhandled: Mutex<Option<RuntimeError>>,
    run_loop: Mutex<Option<RunLoop>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let run_loop = self
            .run_loop
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(run_loop) = run_loop {
            run_loop.stop.cancel();
        }
    }
}

/// In-process runtime: one FIFO envelope queue, one mailbox worker per live
/// agent.
///
/// Drive it either in the foreground with [`process_next`](Self::process_next)
/// / [`run_until_idle`](Self::run_until_idle), or in the background between
/// [`start`](Self::start) and [`stop`](Self::stop).
///
/// Clones share the same runtime.
#[derive(Clone)]
pub struct SingleThreadedRuntime {
    inner: Arc<Inner>,
}

impl SingleThreadedRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let scheduler = Arc::new(Scheduler::new(config.queue_warn_threshold));
        Self {
            inner: Arc::new(Inner {
                config,
                registry: AgentRegistry::new(),
                subscriptions: SubscriptionManager::new(),
                serializers: SerializationRegistry::new(),
                scheduler,
                workers: DashMap::new(),
                interventions: RwLock::new(Vec::new()),
                stats: RuntimeStats::new(),
                unhandled: Mutex::new(None),
                run_loop: Mutex::new(None),
            }),
        }
    }

    fn handle(&self) -> Arc<dyn AgentRuntime> {
        Arc::new(self.clone())
    }

    /// Handle for background tasks that must not keep the runtime alive.
    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub fn serializers(&self) -> &SerializationRegistry {
        &self.inner.serializers
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.inner.stats.snapshot();
        snapshot.queued = self.inner.scheduler.len() as u64;
        snapshot.in_flight = self.inner.scheduler.in_flight() as u64;
        snapshot.agents = self.inner.registry.instance_ids().len() as u64;
        snapshot
    }

    /// Register `agent_type` with a raw factory and add its subscriptions.
    #[tracing::instrument(target = "runtime", skip(self, factory, subscriptions), fields(subscriptions = subscriptions.len()))]
    pub fn register_factory(
        &self,
        agent_type: &str,
        factory: AgentFactory,
        subscriptions: Vec<Arc<dyn Subscription>>,
    ) -> Result<()> {
        self.inner.registry.register(agent_type, factory)?;
        for subscription in subscriptions {
            self.inner.subscriptions.add(subscription)?;
        }
        Ok(())
    }

    /// Register a routed agent type. Its router is built and validated once
    /// here and shared by every instance.
    pub fn register<A, F>(
        &self,
        agent_type: &str,
        factory: F,
        subscriptions: Vec<Arc<dyn Subscription>>,
    ) -> Result<()>
    where
        A: RoutedAgent,
        F: Fn(&InstantiationContext) -> Result<A> + Send + Sync + 'static,
    {
        let router = Arc::new(A::routes());
        router.validate(agent_type)?;
        debug!(
            target: "runtime",
            agent_type = %agent_type,
            handlers = ?router.message_types(),
            "Built router"
        );
        let factory: AgentFactory = Arc::new(move |ctx: &InstantiationContext| {
            let agent = factory(ctx)?;
            Ok(Box::new(RoutedInstance::new(agent, Arc::clone(&router))) as Box<dyn Agent>)
        });
        self.register_factory(agent_type, factory, subscriptions)
    }

    pub fn add_intervention(&self, handler: Arc<dyn InterventionHandler>) {
        self.inner
            .interventions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    fn interventions(&self) -> Vec<Arc<dyn InterventionHandler>> {
        self.inner
            .interventions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The live instance for `id`, created on first access.
    pub fn get_agent_instance(&self, id: &AgentId) -> Result<AgentRef> {
        self.inner
            .registry
            .get_or_create(id, self.handle())
            .map(|(agent, _)| agent)
    }

    pub async fn send(
        &self,
        message: impl Into<AnyMessage>,
        recipient: AgentId,
    ) -> Result<Option<AnyMessage>> {
        self.send_message(message.into(), recipient, SendOptions::default())
            .await
    }

    pub async fn send_expect<R: MessageType>(
        &self,
        message: impl Into<AnyMessage>,
        recipient: AgentId,
    ) -> Result<R> {
        let reply = self.send(message, recipient).await?;
        expect_reply(reply)
    }

    pub async fn publish(&self, message: impl Into<AnyMessage>, topic: TopicId) -> Result<()> {
        self.publish_message(message.into(), topic, PublishOptions::default())
            .await
    }

    fn run_loop_slot(&self) -> MutexGuard<'_, Option<RunLoop>> {
        self.inner
            .run_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.run_loop_slot().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.scheduler.is_closed()
    }

    /// Process one queued envelope to completion, routing any envelopes its
    /// handlers enqueue while it runs. Returns false if the queue was empty.
    ///
    /// A nested envelope bound for an agent that already has an earlier
    /// envelope waiting is routed after that one, so each agent still sees
    /// its messages in enqueue order.
    pub async fn process_next(&self) -> Result<bool> {
        if self.is_running() {
            return Err(RuntimeError::AlreadyRunning);
        }
        let Some(Popped {
            envelope,
            ticket,
            done,
            mut behind,
        }) = self.inner.scheduler.pop()
        else {
            return Ok(false);
        };
        self.route(envelope, ticket);

        tokio::pin!(done);
        loop {
            let activity = self.inner.scheduler.activity();
            tokio::pin!(activity);
            activity.as_mut().enable();
            while let Some(nested) = self.inner.scheduler.pop_at(behind) {
                let mut targets = self.targets(&nested.envelope);
                let ahead = self
                    .inner
                    .scheduler
                    .pop_picked_before(behind, |queued| {
                        let theirs = self.targets(queued);
                        if theirs.iter().any(|id| targets.contains(id)) {
                            targets.extend(theirs);
                            true
                        } else {
                            false
                        }
                    });
                behind -= ahead.len();
                for earlier in ahead {
                    self.route(earlier.envelope, earlier.ticket);
                }
                self.route(nested.envelope, nested.ticket);
            }
            tokio::select! {
                biased;
                _ = &mut done => break,
                _ = activity => {}
            }
        }
        Ok(true)
    }

    /// Process until the queue is empty and no delivery is in flight.
    pub async fn run_until_idle(&self) -> Result<()> {
        if self.is_running() {
            return Err(RuntimeError::AlreadyRunning);
        }
        self.drain().await;
        self.check_unhandled()
    }

    async fn drain(&self) {
        loop {
            let activity = self.inner.scheduler.activity();
            tokio::pin!(activity);
            activity.as_mut().enable();
            if self.route_ready() > 0 {
                continue;
            }
            if self.inner.scheduler.is_idle() {
                return;
            }
            activity.await;
        }
    }

    fn route_ready(&self) -> usize {
        let mut routed = 0;
        while let Some(popped) = self.inner.scheduler.pop() {
            self.route(popped.envelope, popped.ticket);
            routed += 1;
        }
        routed
    }

    /// Start processing in a background task.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.run_loop_slot();
        if slot.is_some() {
            return Err(RuntimeError::AlreadyRunning);
        }
        self.inner.scheduler.reopen();
        let stop = tokio_util::sync::CancellationToken::new();
        let task = tokio::spawn(run(
            self.downgrade(),
            Arc::clone(&self.inner.scheduler),
            stop.clone(),
        ));
        *slot = Some(RunLoop { stop, task });
        info!(target: "runtime", "Runtime started");
        Ok(())
    }

    /// Stop processing. Envelopes still queued fail with `RuntimeStopped`,
    /// as do sends and publishes made afterwards. Deliveries already handed
    /// to agents run to completion.
    pub async fn stop(&self) -> Result<()> {
        let run_loop = self.run_loop_slot().take();
        if let Some(run_loop) = run_loop {
            run_loop.stop.cancel();
            let _ = run_loop.task.await;
        }
        let pending = self.inner.scheduler.close();
        let rejected = pending.len();
        for envelope in pending {
            debug!(
                target: "runtime",
                message_id = envelope.message_id(),
                kind = envelope.kind(),
                "Rejecting queued envelope"
            );
            envelope.reject(RuntimeError::RuntimeStopped);
        }
        info!(target: "runtime", rejected, "Runtime stopped");
        Ok(())
    }

    /// Wait for the queue to drain and in-flight deliveries to finish, then
    /// stop.
    pub async fn stop_when_idle(&self) -> Result<()> {
        if self.is_running() {
            self.inner.scheduler.wait_idle().await;
        } else {
            self.drain().await;
        }
        self.stop().await?;
        self.check_unhandled()
    }

    /// Stop, shut down every mailbox worker and run each agent's `close`
    /// hook. Instances are discarded.
    pub async fn close(&self) -> Result<()> {
        self.stop().await?;

        let worker_ids: Vec<AgentId> = self.inner.workers.iter().map(|e| e.key().clone()).collect();
        for id in worker_ids {
            if let Some((_, mailbox)) = self.inner.workers.remove(&id) {
                mailbox.abort();
            }
        }

        let agents = self.inner.registry.drain_instances();
        let closed = agents.len();
        for agent in agents {
            let mut guard = agent.lock().await;
            if let Err(e) = guard.close().await {
                warn!(target: "runtime", agent_id = %agent.id(), error = %e, "Agent close failed");
            }
        }
        info!(target: "runtime", agents = closed, "Runtime closed");
        Ok(())
    }

    /// State of every live agent, keyed by `type/key`.
    pub async fn save_state(&self) -> Result<HashMap<String, serde_json::Value>> {
        let mut state = HashMap::new();
        for id in self.inner.registry.instance_ids() {
            if let Some(agent) = self.inner.registry.get(&id) {
                let saved = agent.lock().await.save_state().await?;
                state.insert(id.to_string(), saved);
            }
        }
        Ok(state)
    }

    /// Restore agents from [`save_state`](Self::save_state) output, creating
    /// instances as needed.
    pub async fn load_state(&self, state: HashMap<String, serde_json::Value>) -> Result<()> {
        for (key, value) in state {
            let id: AgentId = key.parse()?;
            let agent = self.get_agent_instance(&id)?;
            agent.lock().await.load_state(value).await?;
        }
        Ok(())
    }

    /// Agents an envelope would be delivered to if routed now.
    fn targets(&self, envelope: &Envelope) -> Vec<AgentId> {
        match envelope {
            Envelope::Send(envelope) => vec![envelope.recipient.clone()],
            Envelope::Publish(envelope) => self.inner.subscriptions.resolve(&envelope.topic),
        }
    }

    fn route(&self, envelope: Envelope, ticket: Arc<Ticket>) {
        match envelope {
            Envelope::Send(envelope) => self.route_send(envelope, ticket),
            Envelope::Publish(envelope) => self.route_publish(envelope, ticket),
        }
    }

    fn route_send(&self, envelope: SendEnvelope, ticket: Arc<Ticket>) {
        if envelope.token.is_cancelled() {
            self.inner.stats.record_cancelled();
            let _ = envelope.reply.send(Err(RuntimeError::Cancelled));
            return;
        }
        let agent = match self
            .inner
            .registry
            .get_or_create(&envelope.recipient, self.handle())
        {
            Ok((agent, _)) => agent,
            Err(e) => {
                debug!(target: "runtime", recipient = %envelope.recipient, error = %e, "Send not routable");
                self.inner.stats.record_failed();
                let _ = envelope.reply.send(Err(e));
                return;
            }
        };
        let ctx = MessageContext::new(
            envelope.recipient,
            envelope.sender,
            None,
            true,
            envelope.message_id,
            envelope.token,
            envelope.call_chain,
            self.handle(),
        );
        self.deliver(
            &agent,
            Delivery {
                message: envelope.message,
                ctx,
                outcome: Outcome::Reply(envelope.reply),
                ticket,
            },
        );
    }

    fn route_publish(&self, envelope: PublishEnvelope, ticket: Arc<Ticket>) {
        if envelope.token.is_cancelled() {
            self.inner.stats.record_cancelled();
            return;
        }
        let recipients = self.inner.subscriptions.resolve(&envelope.topic);
        debug!(
            target: "runtime",
            topic = %envelope.topic,
            recipients = recipients.len(),
            message_type = envelope.message.type_name(),
            "Fanning out publish"
        );
        for recipient in recipients {
            if envelope.sender.as_ref() == Some(&recipient) {
                continue;
            }
            let agent = match self.inner.registry.get_or_create(&recipient, self.handle()) {
                Ok((agent, _)) => agent,
                Err(e) => {
                    warn!(target: "runtime", recipient = %recipient, topic = %envelope.topic, error = %e, "Subscriber not routable");
                    self.inner.stats.record_failed();
                    self.record_unhandled(e);
                    continue;
                }
            };
            let ctx = MessageContext::new(
                recipient,
                envelope.sender.clone(),
                Some(envelope.topic.clone()),
                false,
                envelope.message_id.clone(),
                envelope.token.clone(),
                Vec::new(),
                self.handle(),
            );
            self.deliver(
                &agent,
                Delivery {
                    message: envelope.message.clone(),
                    ctx,
                    outcome: Outcome::Publish,
                    ticket: Arc::clone(&ticket),
                },
            );
        }
    }

    fn deliver(&self, agent: &AgentRef, delivery: Delivery) {
        self.inner
            .workers
            .entry(agent.id().clone())
            .or_insert_with(|| Mailbox::spawn(agent.clone(), self.downgrade()))
            .deliver(delivery);
    }

    async fn intervene_send(
        &self,
        message: AnyMessage,
        sender: Option<&AgentId>,
        recipient: &AgentId,
    ) -> Result<AnyMessage> {
        let mut message = message;
        for handler in self.interventions() {
            match handler.on_send(message, sender, recipient).await {
                Intervention::Pass(next) => message = next,
                Intervention::Drop => {
                    debug!(target: "runtime", recipient = %recipient, "Send dropped by intervention");
                    self.inner.stats.record_dropped();
                    return Err(RuntimeError::MessageDropped);
                }
            }
        }
        Ok(message)
    }

    async fn intervene_publish(
        &self,
        message: AnyMessage,
        sender: Option<&AgentId>,
        topic: &TopicId,
    ) -> Option<AnyMessage> {
        let mut message = message;
        for handler in self.interventions() {
            match handler.on_publish(message, sender, topic).await {
                Intervention::Pass(next) => message = next,
                Intervention::Drop => {
                    debug!(target: "runtime", topic = %topic, "Publish dropped by intervention");
                    self.inner.stats.record_dropped();
                    return None;
                }
            }
        }
        Some(message)
    }

    pub(crate) async fn intervene_response(
        &self,
        message: AnyMessage,
        sender: &AgentId,
        recipient: Option<&AgentId>,
    ) -> Result<AnyMessage> {
        let mut message = message;
        for handler in self.interventions() {
            match handler.on_response(message, sender, recipient).await {
                Intervention::Pass(next) => message = next,
                Intervention::Drop => {
                    debug!(target: "runtime", sender = %sender, "Reply dropped by intervention");
                    self.inner.stats.record_dropped();
                    return Err(RuntimeError::MessageDropped);
                }
            }
        }
        Ok(message)
    }

    pub(crate) fn record_outcome(&self, result: &Result<Option<AnyMessage>>) {
        match result {
            Ok(_) => self.inner.stats.record_delivered(),
            Err(RuntimeError::Cancelled) => self.inner.stats.record_cancelled(),
            Err(_) => self.inner.stats.record_failed(),
        }
    }

    pub(crate) fn record_unhandled(&self, err: RuntimeError) {
        let mut slot = self
            .inner
            .unhandled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn check_unhandled(&self) -> Result<()> {
        let unhandled = self
            .inner
            .unhandled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match unhandled {
            Some(err) if !self.inner.config.ignore_unhandled_errors => Err(err),
            _ => Ok(()),
        }
    }
}

/// Background loop behind [`SingleThreadedRuntime::start`]. Exits on `stop`
/// or once every strong handle to the runtime is gone.
async fn run(
    runtime: WeakRuntime,
    scheduler: Arc<Scheduler>,
    stop: tokio_util::sync::CancellationToken,
) {
    loop {
        let activity = scheduler.activity();
        tokio::pin!(activity);
        activity.as_mut().enable();
        match runtime.upgrade() {
            Some(runtime) => {
                runtime.route_ready();
            }
            None => break,
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = activity => {}
        }
    }
    debug!(target: "runtime", "Run loop exited");
}

/// Non-owning handle to a [`SingleThreadedRuntime`].
#[derive(Clone)]
pub(crate) struct WeakRuntime(Weak<Inner>);

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<SingleThreadedRuntime> {
        self.0.upgrade().map(|inner| SingleThreadedRuntime { inner })
    }
}

impl Default for SingleThreadedRuntime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl fmt::Debug for SingleThreadedRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleThreadedRuntime")
            .field("agent_types", &self.inner.registry.agent_types())
            .field("queued", &self.inner.scheduler.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl AgentRuntime for SingleThreadedRuntime {
    #[tracing::instrument(
        target = "runtime",
        skip(self, message, options),
        fields(recipient = %recipient, message_type = message.type_name())
    )]
    async fn send_message(
        &self,
        message: AnyMessage,
        recipient: AgentId,
        options: SendOptions,
    ) -> Result<Option<AnyMessage>> {
        let SendOptions {
            sender,
            cancellation_token,
            message_id,
            call_chain,
        } = options;
        let token = cancellation_token.unwrap_or_default();
        if token.is_cancelled() {
            self.inner.stats.record_cancelled();
            return Err(RuntimeError::Cancelled);
        }
        if self.is_stopped() {
            return Err(RuntimeError::RuntimeStopped);
        }
        if call_chain.contains(&recipient) {
            warn!(target: "runtime", recipient = %recipient, "Send would wait on itself");
            return Err(RuntimeError::Reentrancy(recipient));
        }
        let message = self
            .intervene_send(message, sender.as_ref(), &recipient)
            .await?;

        let (token, timer) = match self.inner.config.send_timeout() {
            Some(timeout) => {
                let child = token.child_token();
                let timer = child.cancel_after(timeout);
                (child, Some(timer))
            }
            None => (token, None),
        };

        let (reply, rx) = oneshot::channel();
        let envelope = Envelope::Send(SendEnvelope {
            message,
            sender,
            recipient,
            token: token.clone(),
            message_id: message_id.unwrap_or_else(new_message_id),
            call_chain,
            reply,
        });
        if self.inner.scheduler.push(envelope).is_err() {
            if let Some(timer) = timer {
                timer.abort();
            }
            return Err(RuntimeError::RuntimeStopped);
        }
        self.inner.stats.record_sent();

        let result = match token.run_until_cancelled(rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RuntimeError::RuntimeStopped),
            Err(e) => Err(e),
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        result
    }

    #[tracing::instrument(
        target = "runtime",
        skip(self, message, options),
        fields(topic = %topic, message_type = message.type_name())
    )]
    async fn publish_message(
        &self,
        message: AnyMessage,
        topic: TopicId,
        options: PublishOptions,
    ) -> Result<()> {
        let PublishOptions {
            sender,
            cancellation_token,
            message_id,
        } = options;
        let token = cancellation_token.unwrap_or_default();
        if token.is_cancelled() {
            self.inner.stats.record_cancelled();
            return Err(RuntimeError::Cancelled);
        }
        if self.is_stopped() {
            return Err(RuntimeError::RuntimeStopped);
        }
        let Some(message) = self
            .intervene_publish(message, sender.as_ref(), &topic)
            .await
        else {
            return Ok(());
        };

        let envelope = Envelope::Publish(PublishEnvelope {
            message,
            sender,
            topic,
            token,
            message_id: message_id.unwrap_or_else(new_message_id),
        });
        if self.inner.scheduler.push(envelope).is_err() {
            return Err(RuntimeError::RuntimeStopped);
        }
        self.inner.stats.record_published();
        Ok(())
    }

    async fn add_subscription(&self, subscription: Arc<dyn Subscription>) -> Result<()> {
        self.inner.subscriptions.add(subscription)
    }

    async fn remove_subscription(&self, id: &str) -> Result<()> {
        self.inner.subscriptions.remove(id)
    }

    async fn agent_save_state(&self, agent: &AgentId) -> Result<serde_json::Value> {
        let agent = self.get_agent_instance(agent)?;
        let state = agent.lock().await.save_state().await;
        state
    }

    async fn agent_load_state(&self, agent: &AgentId, state: serde_json::Value) -> Result<()> {
        let agent = self.get_agent_instance(agent)?;
        let loaded = agent.lock().await.load_state(state).await;
        loaded
    }
}
