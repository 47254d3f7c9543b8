//! Relay protocol message definitions.
//!
//! The relay speaks a simple JSON-over-WebSocket protocol. Message content
//! is opaque to the relay — durability happens through the web application's
//! REST API, which clients call independently of the live push.

use serde::{Deserialize, Serialize};

/// Stable account identifier assigned by the surrounding application.
/// The relay never creates or destroys these.
pub type UserId = u64;

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to a user id.
    /// Must be sent before any `send_message`. The token is the same JWT the
    /// web application issues at login; the relay verifies it names `user_id`
    /// before binding.
    Join {
        user_id: UserId,
        token: String,
    },

    /// Send a chat message to another user's live sessions.
    /// The sender is the bound user of this connection — a client cannot
    /// assert a different `from`.
    SendMessage {
        to: UserId,
        content: String,
    },

    /// Ping to keep connection alive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join acknowledgment — sends are accepted from here on.
    Joined {
        user_id: UserId,
    },

    /// A chat event addressed to this connection's user.
    /// `timestamp` is millis at relay receipt, informational only; the
    /// durable store's persisted timestamp is authoritative for history.
    ReceiveMessage {
        to: UserId,
        from: UserId,
        content: String,
        timestamp: i64,
    },

    /// Pong response to keep connection alive.
    Pong,

    /// Recoverable rejection (send before join, bad token, malformed frame).
    /// The connection stays open.
    Error {
        message: String,
    },
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// An in-flight chat message, consumed by the delivery router as soon as it
/// is created. The relay assigns no durable identity — that belongs to the
/// message store the client writes to over REST.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub to: UserId,
    pub from: UserId,
    pub content: String,
    pub timestamp: i64,
}

impl ChatEvent {
    /// Shape this event as the frame delivered to the addressee's sessions.
    pub fn into_server_message(self) -> ServerMessage {
        ServerMessage::ReceiveMessage {
            to: self.to,
            from: self.from,
            content: self.content,
            timestamp: self.timestamp,
        }
    }
}
