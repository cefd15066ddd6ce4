// Weft Core Library
// In-process agent runtime: typed messages, send/publish, subscriptions,
// cancellation and pluggable serialization.

pub mod agent;
pub mod cancellation;
pub mod config;
mod envelope;
pub mod error;
pub mod message;
pub mod router;
pub mod runtime;
pub mod serialization;
pub mod stats;
pub mod subscription;
pub mod telemetry;
pub mod topic;
pub mod transport;

// Export core types
pub use agent::{
    is_valid_agent_type, Agent, AgentFactory, AgentId, AgentRef, AgentRegistry,
    InstantiationContext, RoutedAgent,
};
pub use cancellation::CancellationToken;
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError, SerializationError};
pub use message::{Ancestor, AnyMessage, Message, MessageType};
pub use router::{Handler, IntoReply, ReplyKind, Router};
pub use runtime::{
    AgentRuntime, Intervention, InterventionHandler, MessageContext, PublishOptions, SendOptions,
    SingleThreadedRuntime,
};
pub use serialization::{
    Codec, JsonCodec, ProtobufCodec, SerializationRegistry, JSON_CONTENT_TYPE,
    PROTOBUF_CONTENT_TYPE,
};
pub use stats::{RuntimeStats, StatsSnapshot};
pub use subscription::{
    DefaultSubscription, DirectSubscription, Subscription, SubscriptionManager,
    TypePrefixSubscription, TypeSubscription,
};
pub use topic::{TopicId, DEFAULT_TOPIC_TYPE};
pub use transport::RpcCorrelator;

// Generated proto code
pub use weft_proto::v1 as proto;
