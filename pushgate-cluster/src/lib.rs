pub mod error;
pub mod redis_pubsub;
pub mod registry;
pub mod router;
pub mod service;

pub use error::{Error, Result};
pub use redis_pubsub::{BroadcastEnvelope, PublishRequest, RedisPubSub};
pub use registry::{ConnectionHandle, RegistryLimits, SessionRegistry};
pub use router::{DeliveryMetrics, MessageRouter};
pub use service::{NodeConfig, PushService, ServiceMetrics};
