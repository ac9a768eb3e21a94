//! Session registry: the table of authenticated peers of one role.
//!
//! A [`Registry`] is a concurrent map from peer id to [`Session`]. Each session
//! carries the sending half of its connection's outbound queue, so callers
//! never touch a socket directly and a slow or dead peer can never stall a
//! broadcast. A relay owns two registries (controllers and agents); a direct
//! hub owns one.
//!
//! Removal is keyed on `(peer_id, session_token)`. Whichever path removes a
//! session first (reader exit, heartbeat eviction, replacement, shutdown)
//! gets it back; every later attempt finds nothing. That is what makes the
//! disconnect notification fire exactly once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fleetwire_types::DuplicatePolicy;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::HandshakeError;
use crate::message::{AgentSummary, PeerRole, WireMessage};

/// Work for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// An encoded text frame.
    Text(String),
    /// Send a close frame with this reason, then stop.
    Close(String),
}

/// A live authenticated connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer_id: String,
    pub role: PeerRole,
    pub display_name: String,
    /// Remote address as reported by the transport.
    pub ip: String,
    pub connected_at: DateTime<Utc>,
    pub session_token: String,
    pub extra_info: Map<String, Value>,
    last_heartbeat: Instant,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: Arc<Notify>,
}

/// The connection-side ends of a [`Session`]: the writer drains `outbound`,
/// the reader stops when `shutdown` fires.
pub struct SessionLink {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub shutdown: Arc<Notify>,
}

impl Session {
    pub fn new(
        peer_id: impl Into<String>,
        role: PeerRole,
        display_name: impl Into<String>,
        ip: impl Into<String>,
        session_token: impl Into<String>,
        extra_info: Map<String, Value>,
    ) -> (Self, SessionLink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let session = Self {
            peer_id: peer_id.into(),
            role,
            display_name: display_name.into(),
            ip: ip.into(),
            connected_at: Utc::now(),
            session_token: session_token.into(),
            extra_info,
            last_heartbeat: Instant::now(),
            outbound: tx,
            shutdown: Arc::clone(&shutdown),
        };
        (
            session,
            SessionLink {
                outbound: rx,
                shutdown,
            },
        )
    }

    /// Monotonic time of the last message received from this peer.
    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    /// `connected_at` as fractional UNIX seconds.
    pub fn connected_at_unix(&self) -> f64 {
        self.connected_at.timestamp_millis() as f64 / 1000.0
    }

    /// Queue a message for this peer. Never blocks.
    ///
    /// Returns `false` if the connection's writer is already gone.
    pub fn send(&self, msg: &WireMessage) -> bool {
        match msg.encode() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(peer_id = %self.peer_id, error = %e, "Failed to encode message");
                false
            }
        }
    }

    pub(crate) fn send_text(&self, text: String) -> bool {
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Close the connection: the writer sends a close frame and the reader stops.
    pub fn close(&self, reason: &str) {
        let _ = self.outbound.send(Outbound::Close(reason.to_string()));
        self.shutdown.notify_one();
    }

    /// The public view pushed to controllers.
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.peer_id.clone(),
            name: self.display_name.clone(),
            ip: self.ip.clone(),
            connected_at: self.connected_at_unix(),
            status: "online".to_string(),
            extra_info: self.extra_info.clone(),
        }
    }
}

/// Concurrent table of live sessions for one role.
#[derive(Debug, Clone)]
pub struct Registry {
    role: PeerRole,
    policy: DuplicatePolicy,
    sessions: Arc<DashMap<String, Session>>,
}

impl Registry {
    pub fn new(role: PeerRole, policy: DuplicatePolicy) -> Self {
        Self {
            role,
            policy,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Add a session.
    ///
    /// Under [`DuplicatePolicy::Replace`] an existing session with the same
    /// peer id is swapped out and returned; the caller closes it and reports
    /// its disconnect. Under [`DuplicatePolicy::Reject`] the new session is
    /// refused.
    pub fn register(&self, session: Session) -> Result<Option<Session>, HandshakeError> {
        let peer_id = session.peer_id.clone();
        match self.sessions.entry(peer_id.clone()) {
            Entry::Occupied(mut existing) => match self.policy {
                DuplicatePolicy::Reject => {
                    warn!(role = %self.role, peer_id = %peer_id, "Duplicate peer id rejected");
                    Err(HandshakeError::DuplicatePeer(peer_id))
                }
                DuplicatePolicy::Replace => {
                    info!(role = %self.role, peer_id = %peer_id, "Replacing existing session");
                    Ok(Some(existing.insert(session)))
                }
            },
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(None)
            }
        }
    }

    /// Remove the session for `peer_id` if it still carries `session_token`.
    ///
    /// Returns the removed session to exactly one caller.
    pub fn unregister(&self, peer_id: &str, session_token: &str, reason: &str) -> Option<Session> {
        let removed = self
            .sessions
            .remove_if(peer_id, |_, s| s.session_token == session_token)
            .map(|(_, s)| s);
        if removed.is_some() {
            info!(role = %self.role, peer_id = %peer_id, reason = %reason, "Session removed");
        } else {
            debug!(role = %self.role, peer_id = %peer_id, "Session already removed");
        }
        removed
    }

    /// Snapshot of one session.
    pub fn lookup(&self, peer_id: &str) -> Option<Session> {
        self.sessions.get(peer_id).map(|s| s.value().clone())
    }

    /// Snapshot of all sessions.
    pub fn list(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether `token` is the live token for `peer_id`.
    pub fn validate_token(&self, peer_id: &str, token: Option<&str>) -> bool {
        match (self.sessions.get(peer_id), token) {
            (Some(s), Some(token)) => s.session_token == token,
            _ => false,
        }
    }

    /// Refresh `last_heartbeat`. Never moves it backwards.
    pub fn touch(&self, peer_id: &str, session_token: &str) -> bool {
        match self.sessions.get_mut(peer_id) {
            Some(mut s) if s.session_token == session_token => {
                let now = Instant::now();
                if now > s.last_heartbeat {
                    s.last_heartbeat = now;
                }
                true
            }
            _ => false,
        }
    }

    /// Queue a message for one peer. `false` if absent or its writer is gone.
    pub fn send_to(&self, peer_id: &str, msg: &WireMessage) -> bool {
        match self.sessions.get(peer_id) {
            Some(s) => s.send(msg),
            None => false,
        }
    }

    /// Queue a message for every live peer. Returns how many accepted it.
    ///
    /// The message is encoded once; a peer whose writer is gone is skipped.
    pub fn broadcast(&self, msg: &WireMessage) -> usize {
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode broadcast");
                return 0;
            }
        };
        let targets = self.list();
        let mut delivered = 0;
        for session in &targets {
            if session.send_text(text.clone()) {
                delivered += 1;
            } else {
                debug!(peer_id = %session.peer_id, "Skipping peer with closed writer");
            }
        }
        delivered
    }

    /// Remove every session, returning them.
    pub fn drain(&self) -> Vec<Session> {
        let ids = self.ids();
        ids.iter()
            .filter_map(|id| self.sessions.remove(id).map(|(_, s)| s))
            .collect()
    }
}
