//! Command dispatcher
//!
//! Maps a peer id (truck or device) to its live session outbox and pushes
//! outbound commands to it. A peer is reachable while a session is bound.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::codec::Message;
use crate::command_types::OutboundCommand;

/// Dispatcher errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No session bound for the peer
    #[error("Peer not reachable: {0}")]
    Unreachable(String),

    /// Session exists but its writer has gone away
    #[error("Session closed for peer {0}")]
    SessionClosed(String),
}

/// Sending half of a session's outbox
pub type Outbox = mpsc::UnboundedSender<Message>;

struct Session {
    session_id: u64,
    outbox: Outbox,
}

/// Registry of live peer sessions
pub struct CommandDispatcher {
    server_id: String,
    sessions: RwLock<HashMap<String, Session>>,
    next_session: AtomicU64,
}

impl CommandDispatcher {
    /// Create a dispatcher that signs messages as `server_id`
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Identifier used as `sender` on outbound messages
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Bind `peer_id` to an outbox, replacing any previous session
    ///
    /// Returns the session id needed to unbind it later.
    pub fn register(&self, peer_id: &str, outbox: Outbox) -> u64 {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions
            .insert(peer_id.to_string(), Session { session_id, outbox })
            .is_some()
        {
            info!(peer_id = %peer_id, session_id, "Session replaced");
        } else {
            info!(peer_id = %peer_id, session_id, "Session registered");
        }
        session_id
    }

    /// Unbind `peer_id` if `session_id` is still its current session
    pub fn unregister(&self, peer_id: &str, session_id: u64) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(peer_id) {
            Some(session) if session.session_id == session_id => {
                sessions.remove(peer_id);
                info!(peer_id = %peer_id, session_id, "Session unregistered");
                true
            }
            _ => false,
        }
    }

    /// Whether a live session is bound for `peer_id`
    pub fn is_reachable(&self, peer_id: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(peer_id)
            .map(|s| !s.outbox.is_closed())
            .unwrap_or(false)
    }

    /// Peers with a bound session
    pub fn connected(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut peers: Vec<String> = sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Push a command to a peer
    pub fn send(
        &self,
        peer_id: &str,
        command: OutboundCommand,
        payload: Map<String, Value>,
    ) -> Result<(), DispatchError> {
        let mut message = Message::new(self.server_id.clone(), peer_id, command.as_str());
        message.payload = payload;
        self.send_message(message)
    }

    /// Push a prepared message to its receiver
    pub fn send_message(&self, message: Message) -> Result<(), DispatchError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let peer_id = message.receiver.clone();
        let session = sessions
            .get(&peer_id)
            .ok_or_else(|| DispatchError::Unreachable(peer_id.clone()))?;

        debug!(peer_id = %peer_id, cmd = %message.cmd, "Dispatching command");
        session
            .outbox
            .send(message)
            .map_err(|_| DispatchError::SessionClosed(peer_id))
    }
}
