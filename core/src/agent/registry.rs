use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::{is_valid_agent_type, Agent, AgentId, AgentRef};
use crate::runtime::AgentRuntime;
use crate::{Result, RuntimeError};

/// Passed to a factory while it builds the instance for `agent_id`, so the
/// agent can close over its own key (e.g. to address sibling agents that
/// share it).
#[derive(Clone)]
pub struct InstantiationContext {
    agent_id: AgentId,
    runtime: Arc<dyn AgentRuntime>,
}

impl InstantiationContext {
    pub(crate) fn new(agent_id: AgentId, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self { agent_id, runtime }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn runtime(&self) -> &Arc<dyn AgentRuntime> {
        &self.runtime
    }
}

impl fmt::Debug for InstantiationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstantiationContext")
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

/// Builds one agent instance. Factories run while the instance table entry
/// for the new id is locked, so they must not call back into the registry.
pub type AgentFactory =
    Arc<dyn Fn(&InstantiationContext) -> Result<Box<dyn Agent>> + Send + Sync>;

/// Agent type → factory, and AgentId → live instance.
///
/// Instances are created lazily on first use and live until the table is
/// drained at runtime teardown; there is no eviction.
#[derive(Default)]
pub struct AgentRegistry {
    factories: DashMap<String, AgentFactory>,
    instances: DashMap<AgentId, AgentRef>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(target = "registry", skip(self, factory))]
    pub fn register(&self, agent_type: &str, factory: AgentFactory) -> Result<()> {
        if !is_valid_agent_type(agent_type) {
            return Err(RuntimeError::InvalidAgentType(agent_type.to_string()));
        }
        match self.factories.entry(agent_type.to_string()) {
            Entry::Occupied(_) => Err(RuntimeError::DuplicateRegistration(
                agent_type.to_string(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(factory);
                info!(target: "registry", agent_type = %agent_type, "Registered agent type");
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, agent_type: &str) -> bool {
        self.factories.contains_key(agent_type)
    }

    /// Registered agent types, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentRef> {
        self.instances.get(id).map(|e| e.value().clone())
    }

    /// Existing instance for `id`, or a fresh one from the type's factory.
    /// The boolean is true when this call created the instance.
    pub fn get_or_create(
        &self,
        id: &AgentId,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Result<(AgentRef, bool)> {
        if let Some(existing) = self.get(id) {
            return Ok((existing, false));
        }

        let factory = self
            .factories
            .get(id.agent_type())
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RuntimeError::UnknownAgentType(id.agent_type().to_string()))?;

        match self.instances.entry(id.clone()) {
            Entry::Occupied(existing) => Ok((existing.get().clone(), false)),
            Entry::Vacant(slot) => {
                let ctx = InstantiationContext::new(id.clone(), runtime);
                let agent = factory(&ctx)?;
                let agent = AgentRef::new(id.clone(), agent);
                slot.insert(agent.clone());
                debug!(target: "registry", agent_id = %id, "Instantiated agent");
                Ok((agent, true))
            }
        }
    }

    /// Live instance ids, sorted.
    pub fn instance_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub(crate) fn drain_instances(&self) -> Vec<AgentRef> {
        let ids = self.instance_ids();
        ids.iter()
            .filter_map(|id| self.instances.remove(id).map(|(_, agent)| agent))
            .collect()
    }
}
