use anyhow::{Context, Result};
use futures::stream::StreamExt;
use pushgate_core::models::{SessionKey, WsMessage};
use redis::{AsyncCommands, Client as RedisClient};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::router::MessageRouter;

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Residual keys and message queued for broadcast.
///
/// Produced by the router after local delivery; consumed by the
/// publisher task, which wraps it in a [`BroadcastEnvelope`].
#[derive(Debug)]
pub struct PublishRequest {
    pub session_keys: Vec<SessionKey>,
    pub message: WsMessage,
}

/// Envelope published on the shared channel.
///
/// Carries the residual key set still needing delivery plus the
/// payload. `origin` names the publishing node for diagnostics only:
/// subscribers process envelopes from every node, their own included,
/// because the residual set already excludes keys the publisher
/// delivered locally.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct BroadcastEnvelope {
    pub origin: String,
    pub session_keys: Vec<SessionKey>,
    pub message: WsMessage,
}

/// Redis Pub/Sub binding for cross-node message fan-out
///
/// Every node publishes residual envelopes to the same channel and
/// subscribes to it:
/// 1. The publisher task drains the router's residual queue into
///    `PUBLISH`es, reconnecting with backoff on Redis failures.
/// 2. The subscriber task feeds received envelopes back into the
///    router, which filters them against the local registry.
pub struct RedisPubSub {
    redis_client: RedisClient,
    router: Arc<MessageRouter>,
    node_id: String,
    channel: String,
    cancel_token: CancellationToken,
}

impl RedisPubSub {
    /// Capacity for the publish queue. Requests are dropped with a
    /// warning when full (e.g., during a prolonged Redis outage).
    pub const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

    pub fn new(
        redis_url: &str,
        router: Arc<MessageRouter>,
        node_id: String,
        channel: String,
    ) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url).context("Failed to create Redis client")?;

        Ok(Self {
            redis_client,
            router,
            node_id,
            channel,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Get the cancellation token for external shutdown signaling
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Shut down the Pub/Sub service (cancels publisher and subscriber tasks)
    pub fn shutdown(&self) {
        info!("Shutting down RedisPubSub service");
        self.cancel_token.cancel();
    }

    /// Start the publisher and subscriber background tasks.
    ///
    /// `publish_rx` is the receiving end of the router's residual
    /// queue.
    pub fn start(self: Arc<Self>, mut publish_rx: mpsc::Receiver<PublishRequest>) {
        let publish_client = self.redis_client.clone();
        let node_id = self.node_id.clone();
        let channel = self.channel.clone();
        let cancel_publisher = self.cancel_token.clone();

        // Publisher task: drain the residual queue, reconnecting with
        // backoff. A request that failed mid-publish is retried once
        // the connection is back.
        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;
            let mut retry_request: Option<PublishRequest> = None;

            loop {
                let conn = match timeout(
                    Duration::from_secs(REDIS_TIMEOUT_SECS),
                    publish_client.get_multiplexed_async_connection(),
                )
                .await
                {
                    Ok(Ok(conn)) => {
                        backoff_secs = INITIAL_BACKOFF_SECS;
                        conn
                    }
                    Ok(Err(e)) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Failed to get Redis connection for publishing, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        continue;
                    }
                    Err(_) => {
                        error!(
                            backoff_secs = backoff_secs,
                            "Timed out getting Redis connection for publishing, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        continue;
                    }
                };

                info!("Redis publisher task (re)connected");
                let mut conn = conn;

                if let Some(req) = retry_request.take() {
                    match Self::publish_envelope(&mut conn, &node_id, &channel, &req).await {
                        Ok(subscribers) => {
                            debug!(
                                residual = req.session_keys.len(),
                                subscribers = subscribers,
                                "Retried envelope published to Redis"
                            );
                        }
                        Err(e) => {
                            warn!(
                                error = %e,
                                "Retry publish failed, will retry after next reconnect"
                            );
                            retry_request = Some(req);
                            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                            continue;
                        }
                    }
                }

                // Process requests until the connection breaks or we
                // are cancelled
                loop {
                    let req = tokio::select! {
                        _ = cancel_publisher.cancelled() => {
                            info!("Redis publisher task cancelled");
                            return;
                        }
                        req = publish_rx.recv() => req,
                    };
                    if let Some(req) = req {
                        match Self::publish_envelope(&mut conn, &node_id, &channel, &req).await {
                            Ok(subscribers) => {
                                debug!(
                                    residual = req.session_keys.len(),
                                    kind = req.message.kind(),
                                    subscribers = subscribers,
                                    "Envelope published to Redis"
                                );
                            }
                            Err(e) => {
                                error!(
                                    error = %e,
                                    "Failed to publish envelope, saving for retry after reconnect"
                                );
                                retry_request = Some(req);
                                break;
                            }
                        }
                    } else {
                        warn!("Redis publish queue closed, exiting");
                        return;
                    }
                }

                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });

        // Subscriber task with exponential backoff on reconnection
        let self_clone = self;
        let cancel_subscriber = self_clone.cancel_token.clone();

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                if cancel_subscriber.is_cancelled() {
                    info!("Redis subscriber task cancelled");
                    return;
                }

                match self_clone.run_subscriber().await {
                    SubscriberExit::Disconnected => {
                        // Connection was healthy before it dropped.
                        // Reset backoff since the server was reachable.
                        error!(
                            "Redis subscriber stream ended (connection lost), reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Redis subscriber failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    _ = cancel_subscriber.cancelled() => {
                        info!("Redis subscriber task cancelled during backoff");
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });
    }

    /// Run the subscriber until the connection drops.
    ///
    /// Returns `SubscriberExit::Disconnected` if the stream ended after
    /// a healthy subscription, `SubscriberExit::ConnectFailed` if
    /// connecting or subscribing failed.
    async fn run_subscriber(&self) -> SubscriberExit {
        let mut pubsub = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.redis_client.get_async_pubsub(),
        )
        .await
        {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context("Failed to get Redis Pub/Sub connection"),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out getting Redis Pub/Sub connection"
                ));
            }
        };

        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(&self.channel),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context(format!("Failed to subscribe to {}", self.channel)),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out subscribing to {}",
                    self.channel
                ));
            }
        }

        info!(channel = %self.channel, "Redis subscriber connected");

        let mut stream = pubsub.on_message();

        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, channel = %self.channel, "Invalid payload");
                    continue;
                }
            };

            match serde_json::from_str::<BroadcastEnvelope>(&payload) {
                Ok(envelope) => {
                    // Envelopes from this node are processed like any
                    // other: the residual set excludes keys already
                    // delivered by our local pass.
                    debug!(
                        origin = %envelope.origin,
                        keys = envelope.session_keys.len(),
                        kind = envelope.message.kind(),
                        self_receipt = envelope.origin == self.node_id,
                        "Envelope received from Redis"
                    );
                    self.router.handle_envelope(&envelope);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        channel = %self.channel,
                        "Failed to deserialize broadcast envelope"
                    );
                }
            }
        }

        // Stream returned None -- the Redis connection was lost
        SubscriberExit::Disconnected
    }

    /// Publish one envelope, returning the channel's subscriber count
    async fn publish_envelope(
        conn: &mut redis::aio::MultiplexedConnection,
        node_id: &str,
        channel: &str,
        request: &PublishRequest,
    ) -> Result<usize> {
        let envelope = BroadcastEnvelope {
            origin: node_id.to_string(),
            session_keys: request.session_keys.clone(),
            message: request.message.clone(),
        };

        let payload =
            serde_json::to_string(&envelope).context("Failed to serialize broadcast envelope")?;

        let subscribers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(channel, &payload),
        )
        .await
        .context("Timed out publishing to Redis")?
        .context("Failed to publish to Redis")?;

        Ok(subscribers)
    }
}

/// Describes how the subscriber loop exited, enabling proper backoff behavior.
enum SubscriberExit {
    /// Connection was established and messages were being processed,
    /// but the stream ended (Redis disconnected). Backoff should be
    /// reset since the connection was healthy before it dropped.
    Disconnected,
    /// Failed to connect or subscribe to Redis. Backoff should continue
    /// increasing to avoid hammering an unavailable server.
    ConnectFailed(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use pushgate_core::models::DeliveryRequest;

    #[test]
    fn test_envelope_serialization() {
        let envelope = BroadcastEnvelope {
            origin: "node1".to_string(),
            session_keys: vec![SessionKey::from("s1"), SessionKey::from("s2")],
            message: WsMessage::Text("hello".to_string()),
        };

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("node1"));
        assert!(json.contains("s1"));

        let deserialized: BroadcastEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.origin, "node1");
        assert_eq!(deserialized.session_keys.len(), 2);
        assert_eq!(deserialized.message, WsMessage::Text("hello".to_string()));
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        let result = serde_json::from_str::<BroadcastEnvelope>("{\"nope\":true}");
        assert!(result.is_err());
    }

    // Integration tests require Redis running
    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_cross_node_delivery() {
        let redis_url = "redis://127.0.0.1:6379";
        let channel = "pushgate:test:messages".to_string();

        // Node 1: publisher side, holds no sessions
        let registry1 = Arc::new(SessionRegistry::default());
        let (tx1, rx1) = mpsc::channel(64);
        let router1 = Arc::new(MessageRouter::new(registry1, Some(tx1)));
        let pubsub1 = Arc::new(
            RedisPubSub::new(redis_url, router1.clone(), "node1".to_string(), channel.clone())
                .unwrap(),
        );
        pubsub1.clone().start(rx1);

        // Node 2: holds the target session
        let registry2 = Arc::new(SessionRegistry::default());
        let (tx2, rx2) = mpsc::channel(64);
        let router2 = Arc::new(MessageRouter::new(registry2.clone(), Some(tx2)));
        let pubsub2 = Arc::new(
            RedisPubSub::new(redis_url, router2, "node2".to_string(), channel).unwrap(),
        );
        pubsub2.clone().start(rx2);

        tokio::time::sleep(Duration::from_millis(500)).await;

        let key = SessionKey::from("remote_session");
        let mut client_rx = registry2.register(key.clone(), None).unwrap();

        // Node 1 routes a message it cannot resolve locally
        router1.publish_message(DeliveryRequest::to_session(
            key,
            WsMessage::Text("Hello from node1!".to_string()),
        ));

        let received = timeout(Duration::from_secs(2), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, WsMessage::Text("Hello from node1!".to_string()));

        pubsub1.shutdown();
        pubsub2.shutdown();
    }
}
