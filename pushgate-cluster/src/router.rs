use pushgate_core::models::{DeliveryRequest, SessionKey, WsMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::redis_pubsub::{BroadcastEnvelope, PublishRequest, RedisPubSub};
use crate::registry::SessionRegistry;

/// Routes messages to session keys: locally when this node holds the
/// connection, over the shared broadcast channel otherwise.
///
/// Delivery is best-effort. Per-key failures are logged and counted,
/// never returned; a failing key does not affect its siblings in the
/// same request.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    /// Queue into the broadcast publisher. `None` in single-node mode.
    publish_tx: Option<mpsc::Sender<PublishRequest>>,

    delivered: AtomicU64,
    failed: AtomicU64,
    published: AtomicU64,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        publish_tx: Option<mpsc::Sender<PublishRequest>>,
    ) -> Self {
        Self {
            registry,
            publish_tx,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    /// Write a message to a single session key's connection if present
    /// on this node.
    ///
    /// No precondition on presence: an absent key is a no-op, since
    /// callers probe for local presence as part of routing. A closed
    /// connection or a failed write is recorded and swallowed; churn is
    /// normal and must not abort sibling deliveries.
    pub fn send(&self, session_key: &SessionKey, message: &WsMessage) {
        let Some(handle) = self.registry.get(session_key) else {
            debug!(session_key = %session_key, "No local session for key");
            return;
        };

        // Identity is optional metadata; log "-" when the accept path
        // attached none.
        let user_id = handle.identity().map_or("-", |id| id.user_id.as_str());

        if !handle.is_open() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                session_key = %session_key,
                user_id = %user_id,
                kind = message.kind(),
                "Session already closed, message dropped"
            );
            return;
        }

        match handle.send(message.clone()) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session_key = %session_key,
                    user_id = %user_id,
                    kind = message.kind(),
                    size = message.len(),
                    "Message delivered to local session"
                );
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_key = %session_key,
                    user_id = %user_id,
                    kind = message.kind(),
                    error = %err,
                    "Failed to write message to session"
                );
            }
        }
    }

    /// Send a pong control frame. Same path as content messages: the
    /// open-check and failure handling above apply unchanged.
    pub fn send_pong(&self, session_key: &SessionKey, payload: Vec<u8>) {
        self.send(session_key, &WsMessage::Pong(payload));
    }

    /// Deliver to every locally held target and broadcast the rest.
    ///
    /// Keys resolvable on this node are delivered inline; the residual
    /// set goes out as a single envelope on the shared channel for the
    /// other nodes to filter. A fully-local request never touches the
    /// channel.
    pub fn publish_message(&self, request: DeliveryRequest) {
        if request.session_keys.is_empty() {
            debug!("Delivery request with no targets, ignoring");
            return;
        }

        let mut residual = Vec::new();
        for session_key in request.session_keys {
            if self.registry.exists(&session_key) {
                self.send(&session_key, &request.message);
            } else {
                residual.push(session_key);
            }
        }

        if residual.is_empty() {
            return;
        }

        self.publish_residual(residual, request.message);
    }

    /// Re-run local delivery for an envelope received from the shared
    /// channel.
    ///
    /// Envelopes reach every node, including the one that published
    /// them; keys not held here are dropped silently. The published
    /// residual excludes keys the publisher already delivered, so
    /// processing our own envelopes cannot double-deliver.
    pub fn handle_envelope(&self, envelope: &BroadcastEnvelope) {
        for session_key in &envelope.session_keys {
            if self.registry.exists(session_key) {
                self.send(session_key, &envelope.message);
            } else {
                debug!(
                    session_key = %session_key,
                    origin = %envelope.origin,
                    "Envelope key not held locally, ignoring"
                );
            }
        }
    }

    /// Queue the residual set onto the broadcast publisher.
    ///
    /// Fire-and-forget: acceptance by the queue is the only outcome the
    /// caller observes. A full or closed queue is logged and the
    /// residual dropped.
    fn publish_residual(&self, session_keys: Vec<SessionKey>, message: WsMessage) {
        let Some(tx) = &self.publish_tx else {
            warn!(
                residual = session_keys.len(),
                "No broadcast channel configured, dropping unresolved keys"
            );
            return;
        };

        let residual = session_keys.len();
        match tx.try_send(PublishRequest {
            session_keys,
            message,
        }) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(residual, "Residual keys queued for broadcast");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    residual,
                    "Broadcast publish queue full (capacity {}), dropping envelope",
                    RedisPubSub::PUBLISH_CHANNEL_CAPACITY
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(residual, "Broadcast publish queue closed, dropping envelope");
            }
        }
    }

    /// Delivery counters snapshot
    #[must_use]
    pub fn metrics(&self) -> DeliveryMetrics {
        DeliveryMetrics {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

/// Delivery counters
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DeliveryMetrics {
    /// Messages written to local connections
    pub delivered: u64,
    /// Per-key failures (closed connection or failed write)
    pub failed: u64,
    /// Envelopes queued onto the broadcast channel
    pub published: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn router_with_channel(
        registry: Arc<SessionRegistry>,
    ) -> (MessageRouter, mpsc::Receiver<PublishRequest>) {
        let (tx, rx) = mpsc::channel(8);
        (MessageRouter::new(registry, Some(tx)), rx)
    }

    fn attach(registry: &SessionRegistry, key: &str) -> UnboundedReceiver<WsMessage> {
        registry.register(SessionKey::from(key), None).unwrap()
    }

    fn text(s: &str) -> WsMessage {
        WsMessage::Text(s.to_string())
    }

    #[tokio::test]
    async fn test_fully_local_request_never_broadcasts() {
        let registry = Arc::new(SessionRegistry::default());
        let (router, mut publish_rx) = router_with_channel(registry.clone());

        let mut rx_a = attach(&registry, "a");
        let mut rx_b = attach(&registry, "b");

        router.publish_message(DeliveryRequest::new(
            vec![SessionKey::from("a"), SessionKey::from("b")],
            text("hello"),
        ));

        assert_eq!(rx_a.recv().await.unwrap(), text("hello"));
        assert_eq!(rx_b.recv().await.unwrap(), text("hello"));
        assert!(publish_rx.try_recv().is_err(), "no broadcast expected");
        assert_eq!(router.metrics().published, 0);
    }

    #[tokio::test]
    async fn test_fully_remote_request_broadcasts_exact_set() {
        let registry = Arc::new(SessionRegistry::default());
        let (router, mut publish_rx) = router_with_channel(registry);

        router.publish_message(DeliveryRequest::new(
            vec![SessionKey::from("x"), SessionKey::from("y")],
            text("payload"),
        ));

        let request = publish_rx.try_recv().unwrap();
        assert_eq!(
            request.session_keys,
            vec![SessionKey::from("x"), SessionKey::from("y")]
        );
        assert_eq!(request.message, text("payload"));
        assert!(publish_rx.try_recv().is_err(), "exactly one envelope");
    }

    #[tokio::test]
    async fn test_mixed_request_partitions_exactly() {
        let registry = Arc::new(SessionRegistry::default());
        let (router, mut publish_rx) = router_with_channel(registry.clone());

        let mut rx_a = attach(&registry, "a");
        let _rx_c = attach(&registry, "c");
        registry.get(&SessionKey::from("c")).unwrap().close();

        router.publish_message(DeliveryRequest::new(
            vec![
                SessionKey::from("a"),
                SessionKey::from("b"),
                SessionKey::from("c"),
            ],
            text("m"),
        ));

        // A delivered, C attempted and recorded as failed
        assert_eq!(rx_a.recv().await.unwrap(), text("m"));
        let metrics = router.metrics();
        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.failed, 1);

        // Envelope carries only the remote key
        let request = publish_rx.try_recv().unwrap();
        assert_eq!(request.session_keys, vec![SessionKey::from("b")]);
    }

    #[tokio::test]
    async fn test_envelope_filtered_to_local_keys() {
        let registry = Arc::new(SessionRegistry::default());
        let (router, _publish_rx) = router_with_channel(registry.clone());

        let mut rx_y = attach(&registry, "y");

        let envelope = BroadcastEnvelope {
            origin: "other-node".to_string(),
            session_keys: vec![SessionKey::from("x"), SessionKey::from("y")],
            message: text("m"),
        };
        router.handle_envelope(&envelope);

        assert_eq!(rx_y.recv().await.unwrap(), text("m"));
        let metrics = router.metrics();
        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.failed, 0, "missing keys are not failures");
    }

    #[tokio::test]
    async fn test_self_receipt_does_not_redeliver() {
        let registry = Arc::new(SessionRegistry::default());
        let (router, mut publish_rx) = router_with_channel(registry.clone());

        let mut rx_a = attach(&registry, "a");

        router.publish_message(DeliveryRequest::new(
            vec![SessionKey::from("a"), SessionKey::from("b")],
            text("m"),
        ));
        assert_eq!(rx_a.recv().await.unwrap(), text("m"));

        // The published residual comes back to the publishing node
        let request = publish_rx.try_recv().unwrap();
        let envelope = BroadcastEnvelope {
            origin: "this-node".to_string(),
            session_keys: request.session_keys,
            message: request.message,
        };
        router.handle_envelope(&envelope);

        assert!(
            rx_a.try_recv().is_err(),
            "locally delivered key must not receive the broadcast copy"
        );
    }

    #[tokio::test]
    async fn test_one_failing_key_does_not_block_siblings() {
        let registry = Arc::new(SessionRegistry::default());
        let (router, _publish_rx) = router_with_channel(registry.clone());

        let mut rx_a = attach(&registry, "a");
        // Dropping the receiver makes writes to "b" fail while the key
        // still resolves locally.
        let rx_b = attach(&registry, "b");
        drop(rx_b);
        let mut rx_c = attach(&registry, "c");

        router.publish_message(DeliveryRequest::new(
            vec![
                SessionKey::from("a"),
                SessionKey::from("b"),
                SessionKey::from("c"),
            ],
            text("m"),
        ));

        assert_eq!(rx_a.recv().await.unwrap(), text("m"));
        assert_eq!(rx_c.recv().await.unwrap(), text("m"));
        let metrics = router.metrics();
        assert_eq!(metrics.delivered, 2);
        assert_eq!(metrics.failed, 1);
    }

    #[tokio::test]
    async fn test_empty_target_set_is_a_noop() {
        let registry = Arc::new(SessionRegistry::default());
        let (router, mut publish_rx) = router_with_channel(registry.clone());

        let mut rx_a = attach(&registry, "a");

        router.publish_message(DeliveryRequest::new(vec![], text("m")));

        assert!(rx_a.try_recv().is_err());
        assert!(publish_rx.try_recv().is_err());
        let metrics = router.metrics();
        assert_eq!(metrics.delivered, 0);
        assert_eq!(metrics.published, 0);
    }

    #[tokio::test]
    async fn test_send_absent_key_is_a_noop() {
        let registry = Arc::new(SessionRegistry::default());
        let (router, _publish_rx) = router_with_channel(registry);

        router.send(&SessionKey::from("ghost"), &text("m"));

        let metrics = router.metrics();
        assert_eq!(metrics.delivered, 0);
        assert_eq!(metrics.failed, 0);
    }

    #[tokio::test]
    async fn test_pong_takes_the_delivery_path() {
        let registry = Arc::new(SessionRegistry::default());
        let (router, _publish_rx) = router_with_channel(registry.clone());

        let mut rx = attach(&registry, "a");
        router.send_pong(&SessionKey::from("a"), vec![1, 2, 3]);
        assert_eq!(rx.recv().await.unwrap(), WsMessage::Pong(vec![1, 2, 3]));

        // Closed connection: pong failure is recorded like any other
        registry.get(&SessionKey::from("a")).unwrap().close();
        router.send_pong(&SessionKey::from("a"), vec![]);
        assert_eq!(router.metrics().failed, 1);
    }

    #[tokio::test]
    async fn test_residual_without_channel_is_dropped() {
        let registry = Arc::new(SessionRegistry::default());
        let router = MessageRouter::new(registry, None);

        // Single-node mode: nothing to publish on, nothing panics
        router.publish_message(DeliveryRequest::new(
            vec![SessionKey::from("remote")],
            text("m"),
        ));
        assert_eq!(router.metrics().published, 0);
    }
}
