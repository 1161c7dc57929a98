pub mod config;
pub mod logging;
pub mod models;

pub use config::{ClusterConfig, Config, LoggingConfig, RedisConfig, ServerConfig};
pub use models::{DeliveryRequest, SessionIdentity, SessionKey, WsMessage};
