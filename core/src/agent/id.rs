use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{proto, RuntimeError};

/// Returns true if `name` is usable as an agent type: non-empty and made of
/// ASCII letters, digits, `_`, `-` and `.`.
pub fn is_valid_agent_type(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Address of exactly one logical agent instance.
///
/// # Examples
///
/// ```
/// use weft_core::AgentId;
///
/// let id = AgentId::new("echo", "default");
/// assert_eq!(id.to_string(), "echo/default");
/// assert_eq!("echo/default".parse::<AgentId>().unwrap(), id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId {
    #[serde(rename = "type")]
    agent_type: String,
    key: String,
}

impl AgentId {
    pub fn new(agent_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            key: key.into(),
        }
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_type, self.key)
    }
}

impl FromStr for AgentId {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (agent_type, key) = s
            .split_once('/')
            .ok_or_else(|| RuntimeError::InvalidAgentType(s.to_string()))?;
        if !is_valid_agent_type(agent_type) {
            return Err(RuntimeError::InvalidAgentType(agent_type.to_string()));
        }
        Ok(Self::new(agent_type, key))
    }
}

impl From<&AgentId> for proto::AgentId {
    fn from(id: &AgentId) -> Self {
        proto::AgentId {
            r#type: id.agent_type.clone(),
            key: id.key.clone(),
        }
    }
}

impl From<proto::AgentId> for AgentId {
    fn from(id: proto::AgentId) -> Self {
        AgentId::new(id.r#type, id.key)
    }
}
