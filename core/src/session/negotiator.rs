//! Connection Negotiator — one state machine per remote peer
//!
//! ```text
//! IDLE --initiate--> NEGOTIATING --link opened--> CONNECTED
//!   \--offer------/                                   |
//!  any state --close / link closed--> CLOSED <--------/
//! ```
//!
//! Offers, answers and candidates travel through the relay; the direct
//! channel itself is owned by a [`DirectLink`]. Every link event carries
//! the link's id and is dropped unless that link is the live one of the
//! peer's current session.

use super::{KeyStore, Role, Session, SessionError, SessionState, SessionSummary};
use crate::crypto::SessionKey;
use crate::relay::RelayRequest;
use crate::transport::{DirectConnector, DirectLink, LinkEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What a link event meant for the session it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The session moved to a new state
    State { peer: String, state: SessionState },
    /// A frame arrived on the direct channel
    Data { peer: String, payload: Vec<u8> },
}

/// Drives every peer session of one local party
pub struct Negotiator {
    local_address: String,
    connector: Arc<dyn DirectConnector>,
    signals: mpsc::UnboundedSender<RelayRequest>,
    keys: KeyStore,
    sessions: HashMap<String, Session>,
}

impl Negotiator {
    pub fn new(
        local_address: &str,
        connector: Arc<dyn DirectConnector>,
        signals: mpsc::UnboundedSender<RelayRequest>,
        keys: KeyStore,
    ) -> Self {
        Self {
            local_address: local_address.to_string(),
            connector,
            signals,
            keys,
            sessions: HashMap::new(),
        }
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn key_for(&self, peer: &str) -> Option<SessionKey> {
        self.keys.get(peer)
    }

    pub fn session(&self, peer: &str) -> Option<&Session> {
        self.sessions.get(peer)
    }

    pub fn state(&self, peer: &str) -> Option<SessionState> {
        self.sessions.get(peer).map(Session::state)
    }

    /// All live sessions, ordered by peer address
    pub fn sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .values()
            .map(|s| SessionSummary {
                peer: s.peer.clone(),
                role: s.role,
                state: s.state,
            })
            .collect();
        summaries.sort_by(|a, b| a.peer.cmp(&b.peer));
        summaries
    }

    /// Start negotiating with `peer` as the initiator.
    ///
    /// Any existing session for the peer is released first. The peer's key
    /// is reused if one exists, otherwise a fresh one is generated, and it
    /// rides in the offer.
    pub async fn initiate(&mut self, peer: &str) -> Result<(), SessionError> {
        self.release(peer);

        let key = self.keys.get_or_generate(peer);
        let (link, offer) = self.connector.offer(peer).await?;

        self.signal(RelayRequest::Offer {
            to: Some(peer.to_string()),
            offer,
            encryption_key: Some(key.to_hex()),
        })?;

        info!("Offered a direct link to {} ({})", peer, link.id());
        let mut session = Session::new(peer, Role::Initiator, SessionState::Negotiating);
        session.link = Some(link);
        self.sessions.insert(peer.to_string(), session);
        Ok(())
    }

    /// Answer an offer relayed from `from`.
    ///
    /// A key that fails to import is logged and skipped; the session still
    /// proceeds and later messages will fail to decrypt one by one.
    ///
    /// When both sides initiate at once, the lower address keeps its offer
    /// and rejects the crossing one; the higher address gives up its own and
    /// answers. Both end up holding the lower address's key.
    pub async fn handle_offer(
        &mut self,
        from: &str,
        offer: &Value,
        key_hex: Option<&str>,
    ) -> Result<(), SessionError> {
        if let Some(current) = self.sessions.get(from) {
            let crossing = current.role == Role::Initiator
                && current.state == SessionState::Negotiating;
            if crossing && self.local_address.as_str() < from {
                debug!("Offer from {} crossed ours, keeping ours", from);
                return Err(SessionError::UnexpectedFrame {
                    peer: from.to_string(),
                    frame: "offer",
                    state: current.state,
                });
            }
        }

        let pending = match self.sessions.remove(from) {
            Some(mut previous) if previous.state == SessionState::Idle => {
                std::mem::take(&mut previous.pending_candidates)
            }
            Some(mut previous) => {
                debug!("Offer from {} supersedes the {} session", from, previous.state);
                previous.release();
                Vec::new()
            }
            None => Vec::new(),
        };

        match key_hex.map(SessionKey::from_hex) {
            Some(Ok(key)) => self.keys.insert(from, key),
            Some(Err(e)) => warn!("Could not import session key from {}: {}", from, e),
            None => debug!("Offer from {} carries no session key", from),
        }

        let (link, answer) = self.connector.answer(from, offer).await?;
        apply_candidates(link.as_ref(), from, pending).await;

        self.signal(RelayRequest::Answer {
            to: Some(from.to_string()),
            answer,
        })?;

        info!("Answered {} ({})", from, link.id());
        let mut session = Session::new(from, Role::Responder, SessionState::Negotiating);
        session.link = Some(link);
        self.sessions.insert(from.to_string(), session);
        Ok(())
    }

    /// Apply the responder's answer. Only an initiator session accepts one.
    pub async fn handle_answer(&mut self, from: &str, answer: &Value) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get(from)
            .ok_or_else(|| SessionError::NoSession(from.to_string()))?;

        let accepts = session.role == Role::Initiator
            && matches!(
                session.state,
                SessionState::Negotiating | SessionState::Connected
            );
        if !accepts {
            return Err(SessionError::UnexpectedFrame {
                peer: from.to_string(),
                frame: "answer",
                state: session.state,
            });
        }

        let result = match &session.link {
            Some(link) => link.apply_answer(answer).await,
            None => return Err(SessionError::NoSession(from.to_string())),
        };

        if let Err(e) = result {
            warn!("Answer from {} rejected: {}", from, e);
            self.release(from);
            return Err(e.into());
        }
        debug!("Applied answer from {}", from);
        Ok(())
    }

    /// Feed a relayed candidate, buffering it if no link exists yet
    pub async fn handle_candidate(&mut self, from: &str, candidate: Value) {
        let session = self
            .sessions
            .entry(from.to_string())
            .or_insert_with(|| Session::new(from, Role::Responder, SessionState::Idle));

        match &session.link {
            Some(link) => {
                if let Err(e) = link.add_candidate(&candidate).await {
                    warn!("Candidate from {} rejected: {}", from, e);
                }
            }
            None => {
                debug!("Buffering candidate from {}", from);
                session.pending_candidates.push(candidate);
            }
        }
    }

    /// Interpret an event from a direct link
    pub fn handle_link_event(&mut self, event: LinkEvent) -> Option<SessionUpdate> {
        let live = self
            .sessions
            .get(event.peer())
            .and_then(|s| s.link.as_ref())
            .map_or(false, |link| link.id() == event.link());

        if !live {
            debug!("Ignoring stale event {}", event);
            return None;
        }

        match event {
            LinkEvent::Opened { peer, link } => {
                let session = self.sessions.get_mut(&peer)?;
                session.state = SessionState::Connected;
                info!("Direct link to {} is up ({})", peer, link);
                Some(SessionUpdate::State {
                    peer,
                    state: SessionState::Connected,
                })
            }
            LinkEvent::Data { peer, payload, .. } => Some(SessionUpdate::Data { peer, payload }),
            LinkEvent::Closed { peer, link } => {
                info!("Direct link to {} closed ({})", peer, link);
                self.release(&peer);
                Some(SessionUpdate::State {
                    peer,
                    state: SessionState::Closed,
                })
            }
            LinkEvent::LocalCandidate {
                peer, candidate, ..
            } => {
                let request = RelayRequest::IceCandidate {
                    to: Some(peer.clone()),
                    candidate,
                };
                if let Err(e) = self.signal(request) {
                    warn!("Could not send candidate to {}: {}", peer, e);
                }
                None
            }
        }
    }

    /// Send one frame over the direct channel.
    ///
    /// Returns `Ok(false)` when no connected session exists, so the caller
    /// can fall back to the relay.
    pub async fn send_direct(&self, peer: &str, payload: &[u8]) -> Result<bool, SessionError> {
        let link = match self.sessions.get(peer) {
            Some(session) if session.state == SessionState::Connected => session.link.as_ref(),
            _ => None,
        };

        match link {
            Some(link) => {
                link.send(payload).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tear down the session with `peer`. Returns whether one existed.
    pub fn close(&mut self, peer: &str) -> bool {
        let existed = self.release(peer);
        if existed {
            info!("Closed session with {}", peer);
        }
        existed
    }

    pub fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.release();
        }
    }

    fn release(&mut self, peer: &str) -> bool {
        match self.sessions.remove(peer) {
            Some(mut session) => {
                session.release();
                true
            }
            None => false,
        }
    }

    fn signal(&self, request: RelayRequest) -> Result<(), SessionError> {
        self.signals
            .send(request)
            .map_err(|_| SessionError::RelayClosed)
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        self.close_all();
    }
}

async fn apply_candidates(link: &dyn DirectLink, peer: &str, candidates: Vec<Value>) {
    for candidate in candidates {
        if let Err(e) = link.add_candidate(&candidate).await {
            warn!("Buffered candidate from {} rejected: {}", peer, e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
