use thiserror::Error;

use crate::agent::AgentId;
use crate::proto;

/// Errors raised by the serialization registry and its codecs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("Serializer already registered for {type_name} ({content_type})")]
    DuplicateSerializer {
        type_name: String,
        content_type: String,
    },

    #[error("No serializer for {type_name} ({content_type})")]
    UnsupportedType {
        type_name: String,
        content_type: String,
    },

    #[error("Value of type {actual} cannot be encoded as {expected}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Payload does not decode as {type_name}: {reason}")]
    DeserializationMismatch { type_name: String, reason: String },

    #[error("Encoding {type_name} failed: {reason}")]
    Encode { type_name: String, reason: String },

    #[error("Polymorphic field used outside of a serialization registry scope")]
    MissingContext,
}

/// Runtime error taxonomy.
///
/// Registration errors are returned synchronously from `register_*` and
/// `add_*` calls; per-message errors travel back through the reply of the
/// originating `send_message`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Agent type already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Invalid agent type name: {0:?}")]
    InvalidAgentType(String),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Agent type {agent_type} declares more than one handler for {message_type}")]
    DuplicateHandler {
        agent_type: String,
        message_type: String,
    },

    #[error("Agent {agent} cannot handle {message_type}: {reason}")]
    CantHandle {
        agent: AgentId,
        message_type: String,
        reason: String,
    },

    #[error("Handler for {message_type} on {agent} declares a reply but was reached by publish")]
    ReplyOnPublish { agent: AgentId, message_type: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Runtime is stopped")]
    RuntimeStopped,

    #[error("Runtime is already running")]
    AlreadyRunning,

    #[error("Message dropped by intervention handler")]
    MessageDropped,

    #[error("Agent {0} is already awaiting a reply on this call chain")]
    Reentrancy(AgentId),

    #[error("Expected reply of type {expected}, got {actual}")]
    UnexpectedReply { expected: String, actual: String },

    #[error("Subscription already exists: {0}")]
    SubscriptionExists(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),
}

impl RuntimeError {
    /// Convenience constructor for failures raised by agent code.
    pub fn handler(message: impl Into<String>) -> Self {
        RuntimeError::Handler(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl From<&RuntimeError> for proto::RpcError {
    fn from(err: &RuntimeError) -> Self {
        use proto::ErrorKind as Kind;

        let mut wire = proto::RpcError {
            message: err.to_string(),
            ..Default::default()
        };
        let kind = match err {
            RuntimeError::DuplicateRegistration(name) => {
                wire.subject = name.clone();
                Kind::DuplicateRegistration
            }
            RuntimeError::InvalidAgentType(name) => {
                wire.subject = name.clone();
                Kind::InvalidAgentType
            }
            RuntimeError::UnknownAgentType(name) => {
                wire.subject = name.clone();
                Kind::UnknownAgentType
            }
            RuntimeError::DuplicateHandler {
                agent_type,
                message_type,
            } => {
                wire.subject = agent_type.clone();
                wire.message_type = message_type.clone();
                Kind::DuplicateHandler
            }
            RuntimeError::CantHandle {
                agent,
                message_type,
                reason,
            } => {
                wire.agent = Some(agent.into());
                wire.message_type = message_type.clone();
                wire.detail = reason.clone();
                Kind::CantHandle
            }
            RuntimeError::ReplyOnPublish {
                agent,
                message_type,
            } => {
                wire.agent = Some(agent.into());
                wire.message_type = message_type.clone();
                Kind::ReplyOnPublish
            }
            RuntimeError::Cancelled => Kind::Cancelled,
            RuntimeError::RuntimeStopped => Kind::RuntimeStopped,
            RuntimeError::AlreadyRunning => Kind::AlreadyRunning,
            RuntimeError::MessageDropped => Kind::MessageDropped,
            RuntimeError::Reentrancy(agent) => {
                wire.agent = Some(agent.into());
                Kind::Reentrancy
            }
            RuntimeError::UnexpectedReply { expected, actual } => {
                wire.subject = expected.clone();
                wire.detail = actual.clone();
                Kind::UnexpectedReply
            }
            RuntimeError::SubscriptionExists(id) => {
                wire.subject = id.clone();
                Kind::SubscriptionExists
            }
            RuntimeError::SubscriptionNotFound(id) => {
                wire.subject = id.clone();
                Kind::SubscriptionNotFound
            }
            RuntimeError::Handler(text) => {
                wire.subject = text.clone();
                Kind::Handler
            }
            RuntimeError::Config(text) => {
                wire.subject = text.clone();
                Kind::Config
            }
            RuntimeError::Serialization(err) => match err {
                SerializationError::DuplicateSerializer {
                    type_name,
                    content_type,
                } => {
                    wire.message_type = type_name.clone();
                    wire.subject = content_type.clone();
                    Kind::DuplicateSerializer
                }
                SerializationError::UnsupportedType {
                    type_name,
                    content_type,
                } => {
                    wire.message_type = type_name.clone();
                    wire.subject = content_type.clone();
                    Kind::UnsupportedType
                }
                SerializationError::TypeMismatch { expected, actual } => {
                    wire.subject = expected.clone();
                    wire.detail = actual.clone();
                    Kind::TypeMismatch
                }
                SerializationError::DeserializationMismatch { type_name, reason } => {
                    wire.message_type = type_name.clone();
                    wire.detail = reason.clone();
                    Kind::DeserializationMismatch
                }
                SerializationError::Encode { type_name, reason } => {
                    wire.message_type = type_name.clone();
                    wire.detail = reason.clone();
                    Kind::Encode
                }
                SerializationError::MissingContext => Kind::MissingContext,
            },
        };
        wire.kind = kind as i32;
        wire
    }
}

/// Rebuild the typed error. Kinds this build does not know, and agent-scoped
/// kinds that arrive without an agent, come back as `Handler` with the
/// error's text.
impl From<proto::RpcError> for RuntimeError {
    fn from(wire: proto::RpcError) -> Self {
        use proto::ErrorKind as Kind;

        let kind = wire.kind();
        let proto::RpcError {
            message,
            agent,
            message_type,
            subject,
            detail,
            ..
        } = wire;
        match (kind, agent.map(AgentId::from)) {
            (Kind::DuplicateRegistration, _) => RuntimeError::DuplicateRegistration(subject),
            (Kind::InvalidAgentType, _) => RuntimeError::InvalidAgentType(subject),
            (Kind::UnknownAgentType, _) => RuntimeError::UnknownAgentType(subject),
            (Kind::DuplicateHandler, _) => RuntimeError::DuplicateHandler {
                agent_type: subject,
                message_type,
            },
            (Kind::CantHandle, Some(agent)) => RuntimeError::CantHandle {
                agent,
                message_type,
                reason: detail,
            },
            (Kind::ReplyOnPublish, Some(agent)) => RuntimeError::ReplyOnPublish {
                agent,
                message_type,
            },
            (Kind::Cancelled, _) => RuntimeError::Cancelled,
            (Kind::RuntimeStopped, _) => RuntimeError::RuntimeStopped,
            (Kind::AlreadyRunning, _) => RuntimeError::AlreadyRunning,
            (Kind::MessageDropped, _) => RuntimeError::MessageDropped,
            (Kind::Reentrancy, Some(agent)) => RuntimeError::Reentrancy(agent),
            (Kind::UnexpectedReply, _) => RuntimeError::UnexpectedReply {
                expected: subject,
                actual: detail,
            },
            (Kind::SubscriptionExists, _) => RuntimeError::SubscriptionExists(subject),
            (Kind::SubscriptionNotFound, _) => RuntimeError::SubscriptionNotFound(subject),
            (Kind::Handler, _) => RuntimeError::Handler(subject),
            (Kind::Config, _) => RuntimeError::Config(subject),
            (Kind::DuplicateSerializer, _) => SerializationError::DuplicateSerializer {
                type_name: message_type,
                content_type: subject,
            }
            .into(),
            (Kind::UnsupportedType, _) => SerializationError::UnsupportedType {
                type_name: message_type,
                content_type: subject,
            }
            .into(),
            (Kind::TypeMismatch, _) => SerializationError::TypeMismatch {
                expected: subject,
                actual: detail,
            }
            .into(),
            (Kind::DeserializationMismatch, _) => SerializationError::DeserializationMismatch {
                type_name: message_type,
                reason: detail,
            }
            .into(),
            (Kind::Encode, _) => SerializationError::Encode {
                type_name: message_type,
                reason: detail,
            }
            .into(),
            (Kind::MissingContext, _) => SerializationError::MissingContext.into(),
            _ => RuntimeError::Handler(message),
        }
    }
}
