//! Topic → agent resolution.
//!
//! A [`Subscription`] is a rule that matches [`TopicId`]s and maps each match
//! to exactly one [`AgentId`]. The [`SubscriptionManager`] keeps rules in
//! insertion order and caches the resolved recipients per topic.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::topic::{TopicId, DEFAULT_TOPIC_TYPE};
use crate::{Result, RuntimeError};

/// A topic-matching rule with a unique id.
pub trait Subscription: fmt::Debug + Send + Sync {
    fn id(&self) -> &str;

    fn is_match(&self, topic: &TopicId) -> bool;

    /// Recipient for a matching topic. Only called when `is_match` holds.
    fn map_to_agent(&self, topic: &TopicId) -> Result<AgentId>;
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn not_matching(subscription: &dyn Subscription, topic: &TopicId) -> RuntimeError {
    RuntimeError::Config(format!(
        "topic {} does not match subscription {}",
        topic,
        subscription.id()
    ))
}

/// `TopicId(topic_type, source)` → `AgentId(agent_type, source)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSubscription {
    id: String,
    topic_type: String,
    agent_type: String,
}

impl TypeSubscription {
    pub fn new(topic_type: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            topic_type: topic_type.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn topic_type(&self) -> &str {
        &self.topic_type
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }
}

impl Subscription for TypeSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_match(&self, topic: &TopicId) -> bool {
        topic.topic_type() == self.topic_type
    }

    fn map_to_agent(&self, topic: &TopicId) -> Result<AgentId> {
        if !self.is_match(topic) {
            return Err(not_matching(self, topic));
        }
        Ok(AgentId::new(self.agent_type.clone(), topic.source()))
    }
}

/// Like [`TypeSubscription`] but matches every topic type starting with
/// `prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypePrefixSubscription {
    id: String,
    prefix: String,
    agent_type: String,
}

impl TypePrefixSubscription {
    pub fn new(prefix: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            prefix: prefix.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl Subscription for TypePrefixSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_match(&self, topic: &TopicId) -> bool {
        topic.topic_type().starts_with(&self.prefix)
    }

    fn map_to_agent(&self, topic: &TopicId) -> Result<AgentId> {
        if !self.is_match(topic) {
            return Err(not_matching(self, topic));
        }
        Ok(AgentId::new(self.agent_type.clone(), topic.source()))
    }
}

/// Delivers a topic type to one fixed agent, whatever the source. Narrow it
/// to a single source with [`DirectSubscription::for_source`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectSubscription {
    id: String,
    topic_type: String,
    source: Option<String>,
    agent_id: AgentId,
}

impl DirectSubscription {
    pub fn new(topic_type: impl Into<String>, agent_id: AgentId) -> Self {
        Self {
            id: new_id(),
            topic_type: topic_type.into(),
            source: None,
            agent_id,
        }
    }

    pub fn for_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl Subscription for DirectSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_match(&self, topic: &TopicId) -> bool {
        topic.topic_type() == self.topic_type
            && self
                .source
                .as_deref()
                .map_or(true, |source| source == topic.source())
    }

    fn map_to_agent(&self, topic: &TopicId) -> Result<AgentId> {
        if !self.is_match(topic) {
            return Err(not_matching(self, topic));
        }
        Ok(self.agent_id.clone())
    }
}

/// Subscribes `agent_type` to the `"default"` topic type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultSubscription(TypeSubscription);

impl DefaultSubscription {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self(TypeSubscription::new(DEFAULT_TOPIC_TYPE, agent_type))
    }

    pub fn with_id(self, id: impl Into<String>) -> Self {
        Self(self.0.with_id(id))
    }
}

impl Subscription for DefaultSubscription {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn is_match(&self, topic: &TopicId) -> bool {
        self.0.is_match(topic)
    }

    fn map_to_agent(&self, topic: &TopicId) -> Result<AgentId> {
        self.0.map_to_agent(topic)
    }
}

/// Ordered subscription table with a per-topic recipient cache.
#[derive(Default)]
pub struct SubscriptionManager {
    subscriptions: RwLock<Vec<Arc<dyn Subscription>>>,
    cache: DashMap<TopicId, Vec<AgentId>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn Subscription>>> {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn Subscription>>> {
        self.subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[tracing::instrument(target = "subscriptions", skip(self, subscription), fields(id = subscription.id()))]
    pub fn add(&self, subscription: Arc<dyn Subscription>) -> Result<()> {
        let mut subscriptions = self.write();
        if subscriptions.iter().any(|s| s.id() == subscription.id()) {
            return Err(RuntimeError::SubscriptionExists(subscription.id().to_string()));
        }
        info!(target: "subscriptions", subscription = ?subscription, "Subscription added");
        subscriptions.push(subscription);
        self.cache.clear();
        Ok(())
    }

    #[tracing::instrument(target = "subscriptions", skip(self))]
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut subscriptions = self.write();
        let index = subscriptions
            .iter()
            .position(|s| s.id() == id)
            .ok_or_else(|| RuntimeError::SubscriptionNotFound(id.to_string()))?;
        subscriptions.remove(index);
        self.cache.clear();
        info!(target: "subscriptions", id = %id, "Subscription removed");
        Ok(())
    }

    /// Recipients for `topic`: one per matching rule in insertion order,
    /// duplicates removed.
    pub fn resolve(&self, topic: &TopicId) -> Vec<AgentId> {
        if let Some(cached) = self.cache.get(topic) {
            return cached.value().clone();
        }

        // Holding the read lock while filling the cache keeps a concurrent
        // add/remove from clearing it before the stale entry lands.
        let subscriptions = self.read();
        let mut recipients: Vec<AgentId> = Vec::new();
        for subscription in subscriptions.iter().filter(|s| s.is_match(topic)) {
            match subscription.map_to_agent(topic) {
                Ok(agent_id) if !recipients.contains(&agent_id) => recipients.push(agent_id),
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "subscriptions", id = subscription.id(), topic = %topic, error = %e, "Subscription failed to map topic");
                }
            }
        }
        debug!(target: "subscriptions", topic = %topic, recipients = recipients.len(), "Resolved topic");
        self.cache.insert(topic.clone(), recipients.clone());
        recipients
    }

    /// Subscription ids in insertion order.
    pub fn ids(&self) -> Vec<String> {
        self.read().iter().map(|s| s.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.len())
            .finish()
    }
}
