use serde::{Deserialize, Serialize};

use super::id::SessionKey;

/// Payload delivered verbatim to client connections.
///
/// The router imposes no structure on the payload: text and binary
/// frames are forwarded as-is. `Pong` is the liveness probe response and
/// travels through the same delivery path as content messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
    /// Pong control frame (keep-alive response)
    Pong(Vec<u8>),
}

impl WsMessage {
    /// Short label for log fields
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Pong(_) => "pong",
        }
    }

    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) | Self::Pong(b) => b.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A message addressed to one or more session keys.
///
/// Created by request-handling code at the moment a message must reach
/// clients, consumed once by the router. Key order is irrelevant; an
/// empty key set is legal and results in no delivery and no broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub session_keys: Vec<SessionKey>,
    pub message: WsMessage,
}

impl DeliveryRequest {
    #[must_use]
    pub fn new(session_keys: Vec<SessionKey>, message: WsMessage) -> Self {
        Self {
            session_keys,
            message,
        }
    }

    /// Request targeting a single session
    #[must_use]
    pub fn to_session(session_key: SessionKey, message: WsMessage) -> Self {
        Self {
            session_keys: vec![session_key],
            message,
        }
    }
}

/// Authenticated identity bound to a connection at accept time.
///
/// Purely a logging enhancement: delivery must work identically when the
/// accept path attached no identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: String,
    pub user_type: String,
}

impl SessionIdentity {
    #[must_use]
    pub fn new(user_id: impl Into<String>, user_type: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_type: user_type.into(),
        }
    }
}
