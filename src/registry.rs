//! Presence registry and delivery router.
//!
//! Maps each user id to their live sessions. A user may hold several
//! sessions at once (multiple tabs or devices); each session has its own
//! outbound channel. The registry lives only in this process and is rebuilt
//! empty on restart — the durable message store covers anyone not connected.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ChatEvent, ServerMessage, UserId};

/// Relay-assigned identifier for one live connection.
pub type SessionId = Uuid;

/// A session's outbound channel. The receiving half is drained by that
/// session's sender task, so pushes here are FIFO per session.
pub type SessionSender = mpsc::UnboundedSender<ServerMessage>;

/// Concurrency-safe presence map. A session id appears under at most one
/// user id: the connection handler registers it exactly once, after join.
#[derive(Default)]
pub struct PresenceRegistry {
    /// User id → that user's live sessions.
    sessions: DashMap<UserId, HashMap<SessionId, SessionSender>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    // ── Session Lifecycle ─────────────────────────────────────────────────

    /// Register a session under a user id. Creates the user's entry lazily.
    pub fn add_session(&self, user_id: UserId, session_id: SessionId, sender: SessionSender) {
        tracing::info!(user_id, session_id = %session_id, "Session joined");
        self.sessions
            .entry(user_id)
            .or_default()
            .insert(session_id, sender);
    }

    /// Remove a session from its user's set. A no-op if the session was
    /// already removed — disconnect and push-failure cleanup may race.
    /// The user's entry is dropped when its last session goes away.
    pub fn remove_session(&self, user_id: UserId, session_id: SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(&user_id) {
            if entry.remove(&session_id).is_some() {
                tracing::info!(user_id, session_id = %session_id, "Session removed");
            }
        }
        self.sessions.remove_if(&user_id, |_, set| set.is_empty());
    }

    /// Snapshot of a user's live session ids. Empty if the user has none.
    pub fn sessions_for(&self, user_id: UserId) -> Vec<SessionId> {
        self.sessions
            .get(&user_id)
            .map(|entry| entry.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a user currently has at least one live session.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.sessions.contains_key(&user_id)
    }

    // ── Delivery Router ───────────────────────────────────────────────────

    /// Fan a chat event out to every live session of its addressee.
    /// Returns the number of sessions the event was delivered to.
    ///
    /// Best-effort and at-most-once per session: an addressee with no live
    /// sessions is a silent no-op (they read the message from the durable
    /// store later), and a failed push to one session never blocks its
    /// siblings. A session whose channel is gone gets the same cleanup as a
    /// disconnect, so the registry never keeps a stale entry.
    pub fn route(&self, event: ChatEvent) -> usize {
        let targets: Vec<(SessionId, SessionSender)> = match self.sessions.get(&event.to) {
            Some(entry) => entry
                .iter()
                .map(|(id, sender)| (*id, sender.clone()))
                .collect(),
            None => return 0,
        };

        let to = event.to;
        let message = event.into_server_message();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (session_id, sender) in targets {
            if sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(session_id);
            }
        }

        for session_id in dead {
            tracing::warn!(
                user_id = to,
                session_id = %session_id,
                "Push failed, dropping dead session"
            );
            self.remove_session(to, session_id);
        }

        delivered
    }

    // ── Stats ─────────────────────────────────────────────────────────────

    /// Number of users with at least one live session.
    pub fn online_users(&self) -> usize {
        self.sessions.len()
    }

    /// Total number of live sessions across all users.
    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().len()).sum()
    }
}
