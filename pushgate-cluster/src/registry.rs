use dashmap::DashMap;
use pushgate_core::models::{SessionIdentity, SessionKey, WsMessage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Handle to a live connection held on this node.
///
/// The registry owns the handle; the router only queries and writes
/// through it. Writes go to the connection's writer task via an
/// unbounded channel; the open flag is flipped by the writer task when
/// the transport fails, so open-state is authoritative only on the
/// owning node.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    session_key: SessionKey,
    identity: Option<SessionIdentity>,
    sender: mpsc::UnboundedSender<WsMessage>,
    open: Arc<AtomicBool>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// Identity metadata attached at accept time, if any. Logging
    /// enhancement only, never a delivery precondition.
    #[must_use]
    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Mark the connection closed. Idempotent.
    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    /// Shared open flag, handed to the transport's writer task so it
    /// can mark the connection closed on write failure.
    #[must_use]
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }

    /// Write a message toward the connection's writer task.
    pub fn send(&self, message: WsMessage) -> std::result::Result<(), mpsc::error::SendError<WsMessage>> {
        self.sender.send(message)
    }
}

/// Registry limits configuration
#[derive(Debug, Clone)]
pub struct RegistryLimits {
    /// Maximum live sessions on this node
    pub max_sessions: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
        }
    }
}

/// Per-node mapping from session key to live connection handle.
///
/// Consumers rely only on point queries (`exists`, `get`) and the
/// handle's send surface; the storage behind them is not part of the
/// contract. Safe for concurrent use from request tasks and the
/// broadcast subscriber.
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, ConnectionHandle>,
    limits: RegistryLimits,
    total_registered: AtomicU64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
            total_registered: AtomicU64::new(0),
        }
    }

    /// Bind a session key to a new connection.
    ///
    /// Returns the receiver the transport's writer task drains. A key
    /// already present is rebound: one key maps to one physical
    /// connection, so the stale handle is closed and replaced.
    pub fn register(
        &self,
        session_key: SessionKey,
        identity: Option<SessionIdentity>,
    ) -> Result<mpsc::UnboundedReceiver<WsMessage>> {
        if self.sessions.len() >= self.limits.max_sessions
            && !self.sessions.contains_key(&session_key)
        {
            return Err(Error::AtCapacity(self.limits.max_sessions));
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let handle = ConnectionHandle {
            session_key: session_key.clone(),
            identity,
            sender: tx,
            open: Arc::new(AtomicBool::new(true)),
        };

        if let Some(stale) = self.sessions.insert(session_key.clone(), handle) {
            stale.close();
            warn!(
                session_key = %session_key,
                "Replaced existing connection for session key"
            );
        }

        self.total_registered.fetch_add(1, Ordering::Relaxed);

        info!(
            session_key = %session_key,
            active_sessions = self.sessions.len(),
            "Session registered"
        );

        Ok(rx)
    }

    /// Remove a session binding. Unknown keys are ignored.
    pub fn unregister(&self, session_key: &SessionKey) {
        if let Some((_, handle)) = self.sessions.remove(session_key) {
            handle.close();
            info!(
                session_key = %session_key,
                active_sessions = self.sessions.len(),
                "Session unregistered"
            );
        }
    }

    /// Whether this node currently holds a connection for the key
    #[must_use]
    pub fn exists(&self, session_key: &SessionKey) -> bool {
        self.sessions.contains_key(session_key)
    }

    /// Get the connection handle for a key, if held on this node
    #[must_use]
    pub fn get(&self, session_key: &SessionKey) -> Option<ConnectionHandle> {
        self.sessions.get(session_key).map(|h| h.clone())
    }

    /// Number of live sessions on this node
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total sessions ever registered on this node
    #[must_use]
    pub fn total_registered(&self) -> u64 {
        self.total_registered.load(Ordering::Relaxed)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}
