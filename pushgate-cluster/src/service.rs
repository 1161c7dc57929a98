//! Node-level push service
//!
//! Unified entry point tying together the session registry, the
//! message router and the Redis Pub/Sub binding. Request handlers and
//! the transport layer talk to this facade only.

use pushgate_core::models::{DeliveryRequest, SessionIdentity, SessionKey, WsMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::redis_pubsub::RedisPubSub;
use crate::registry::{RegistryLimits, SessionRegistry};
use crate::router::MessageRouter;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Redis connection URL. Empty selects single-node mode.
    pub redis_url: String,
    /// Unique identifier for this node
    pub node_id: String,
    /// Shared broadcast channel name
    pub channel: String,
    /// Capacity of the publish queue
    pub publish_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            node_id: format!("node_{}", nanoid::nanoid!(8)),
            channel: "pushgate:messages".to_string(),
            publish_capacity: RedisPubSub::PUBLISH_CHANNEL_CAPACITY,
        }
    }
}

/// Per-node push service
///
/// Owns the registry and router; when Redis is configured it also runs
/// the broadcast publisher and subscriber tasks. All delivery entry
/// points are fire-and-forget: callers receive no per-key outcome.
pub struct PushService {
    registry: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    /// Redis Pub/Sub binding (stored for graceful shutdown)
    redis_pubsub: Option<Arc<RedisPubSub>>,
    node_id: String,
}

impl PushService {
    /// Create a push service, starting the broadcast tasks when a
    /// Redis URL is configured.
    pub fn new(config: NodeConfig, limits: RegistryLimits) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(limits));

        let (router, redis_pubsub) = if config.redis_url.is_empty() {
            warn!("Redis URL not provided, running in single-node mode");
            let router = Arc::new(MessageRouter::new(registry.clone(), None));
            (router, None)
        } else {
            let (publish_tx, publish_rx) = mpsc::channel(config.publish_capacity);
            let router = Arc::new(MessageRouter::new(registry.clone(), Some(publish_tx)));
            let pubsub = Arc::new(
                RedisPubSub::new(
                    &config.redis_url,
                    router.clone(),
                    config.node_id.clone(),
                    config.channel.clone(),
                )
                .map_err(|e| Error::Redis(e.to_string()))?,
            );
            pubsub.clone().start(publish_rx);
            (router, Some(pubsub))
        };

        info!(
            node_id = %config.node_id,
            channel = %config.channel,
            redis_enabled = redis_pubsub.is_some(),
            "Push service initialized"
        );

        Ok(Self {
            registry,
            router,
            redis_pubsub,
            node_id: config.node_id,
        })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::new(NodeConfig::default(), RegistryLimits::default())
    }

    /// Bind a session key to a new connection; the returned receiver
    /// feeds the transport's writer task.
    pub fn attach(
        &self,
        session_key: SessionKey,
        identity: Option<SessionIdentity>,
    ) -> Result<mpsc::UnboundedReceiver<WsMessage>> {
        self.registry.register(session_key, identity)
    }

    /// Remove a session binding
    pub fn detach(&self, session_key: &SessionKey) {
        self.registry.unregister(session_key);
    }

    /// Deliver a message to a locally held session. Absent or failed
    /// keys are logged, never surfaced.
    pub fn send(&self, session_key: &SessionKey, message: WsMessage) {
        self.router.send(session_key, &message);
    }

    /// Deliver a pong control frame through the regular delivery path
    pub fn send_pong(&self, session_key: &SessionKey, payload: Vec<u8>) {
        self.router.send_pong(session_key, payload);
    }

    /// Route a message to every target key: local keys delivered
    /// directly, the residual broadcast cluster-wide.
    pub fn publish_message(&self, request: DeliveryRequest) {
        self.router.publish_message(request);
    }

    /// Get the session registry (for the connection-accept path)
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the message router
    #[must_use]
    pub const fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Gracefully shut down the broadcast tasks
    pub fn shutdown(&self) {
        info!("Shutting down PushService");
        if let Some(ref pubsub) = self.redis_pubsub {
            pubsub.shutdown();
        }
    }

    /// Get service metrics
    #[must_use]
    pub fn metrics(&self) -> ServiceMetrics {
        let delivery = self.router.metrics();
        ServiceMetrics {
            node_id: self.node_id.clone(),
            active_sessions: self.registry.session_count(),
            total_registered: self.registry.total_registered(),
            delivered: delivery.delivered,
            failed: delivery.failed,
            published: delivery.published,
            redis_enabled: self.redis_pubsub.is_some(),
        }
    }
}

/// Service metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceMetrics {
    pub node_id: String,
    pub active_sessions: usize,
    pub total_registered: u64,
    pub delivered: u64,
    pub failed: u64,
    pub published: u64,
    pub redis_enabled: bool,
}
