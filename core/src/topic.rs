use std::fmt;

use serde::{Deserialize, Serialize};

use crate::proto;

/// Topic type used by [`DefaultSubscription`](crate::DefaultSubscription).
pub const DEFAULT_TOPIC_TYPE: &str = "default";

/// A broadcast channel: `topic_type` names the stream, `source` partitions it
/// (e.g. one stream per conversation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId {
    #[serde(rename = "type")]
    topic_type: String,
    source: String,
}

impl TopicId {
    pub fn new(topic_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            topic_type: topic_type.into(),
            source: source.into(),
        }
    }

    /// `TopicId("default", source)`.
    pub fn default_for(source: impl Into<String>) -> Self {
        Self::new(DEFAULT_TOPIC_TYPE, source)
    }

    pub fn topic_type(&self) -> &str {
        &self.topic_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic_type, self.source)
    }
}

impl From<&TopicId> for proto::TopicId {
    fn from(topic: &TopicId) -> Self {
        proto::TopicId {
            r#type: topic.topic_type.clone(),
            source: topic.source.clone(),
        }
    }
}

impl From<proto::TopicId> for TopicId {
    fn from(topic: proto::TopicId) -> Self {
        TopicId::new(topic.r#type, topic.source)
    }
}
