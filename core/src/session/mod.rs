// Session module — per-peer negotiation state and the local key store

pub mod negotiator;

pub use negotiator::Negotiator;

use crate::crypto::{CryptoError, SessionKey};
use crate::transport::{DirectLink, TransportError};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Lifecycle of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Known peer, nothing sent yet (candidates may be buffered)
    Idle,
    /// Offer or answer sent, direct channel not up yet
    Negotiating,
    /// Direct channel open both ways
    Connected,
    /// Torn down
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Negotiating => write!(f, "NEGOTIATING"),
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No session for peer {0}")]
    NoSession(String),
    #[error("Unexpected {frame} from {peer} while {state}")]
    UnexpectedFrame {
        peer: String,
        frame: &'static str,
        state: SessionState,
    },
    #[error("Relay link is gone")]
    RelayClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// One negotiation with one peer
pub struct Session {
    pub(crate) peer: String,
    pub(crate) role: Role,
    pub(crate) state: SessionState,
    pub(crate) pending_candidates: Vec<Value>,
    pub(crate) link: Option<Box<dyn DirectLink>>,
}

impl Session {
    pub(crate) fn new(peer: &str, role: Role, state: SessionState) -> Self {
        Self {
            peer: peer.to_string(),
            role,
            state,
            pending_candidates: Vec::new(),
            link: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Release the link and any buffered candidates. Safe to call twice.
    pub(crate) fn release(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.pending_candidates.clear();
        self.state = SessionState::Closed;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("link", &self.link.as_ref().map(|l| l.id()))
            .finish()
    }
}

/// Snapshot of a session for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer: String,
    pub role: Role,
    pub state: SessionState,
}

/// Session keys by peer address.
///
/// The only state shared between the sessions of one party.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    keys: Arc<RwLock<HashMap<String, SessionKey>>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &str) -> Option<SessionKey> {
        self.keys.read().get(peer).cloned()
    }

    pub fn insert(&self, peer: &str, key: SessionKey) {
        self.keys.write().insert(peer.to_string(), key);
    }

    /// Key for `peer`, generating one if none exists yet
    pub fn get_or_generate(&self, peer: &str) -> SessionKey {
        self.keys
            .write()
            .entry(peer.to_string())
            .or_insert_with(SessionKey::generate)
            .clone()
    }

    pub fn remove(&self, peer: &str) -> Option<SessionKey> {
        self.keys.write().remove(peer)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.keys.read().contains_key(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Negotiating.to_string(), "NEGOTIATING");
        assert_eq!(SessionState::Connected.to_string(), "CONNECTED");
    }

    #[test]
    fn test_key_store_generates_once() {
        let store = KeyStore::new();
        assert!(!store.contains("BOB"));

        let first = store.get_or_generate("BOB");
        let second = store.get_or_generate("BOB");
        assert_eq!(first, second);
        assert_eq!(store.get("BOB"), Some(first));
    }

    #[test]
    fn test_key_store_clones_share_keys() {
        let store = KeyStore::new();
        let view = store.clone();

        store.insert("BOB", SessionKey::generate());
        assert!(view.contains("BOB"));

        view.remove("BOB");
        assert!(store.get("BOB").is_none());
    }

    #[test]
    fn test_release_clears_candidates() {
        let mut session = Session::new("BOB", Role::Responder, SessionState::Idle);
        session.pending_candidates.push(serde_json::json!({"addr": "10.0.0.1:1"}));

        session.release();
        session.release();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.pending_candidates(), 0);
    }
}
