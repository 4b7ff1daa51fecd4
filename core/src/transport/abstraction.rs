//! Direct transport abstraction
//!
//! Defines what the negotiator needs from a direct channel: a connector
//! that produces offers and answers, links that accept the remote side's
//! answer and candidates, and a tagged event stream reporting what each
//! link is doing.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Identity of one direct link attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Events from a direct link to the negotiator
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The channel is open both ways
    Opened { peer: String, link: LinkId },
    /// One frame arrived
    Data {
        peer: String,
        link: LinkId,
        payload: Vec<u8>,
    },
    /// The channel closed or failed
    Closed { peer: String, link: LinkId },
    /// A local dial target the remote side should also try
    LocalCandidate {
        peer: String,
        link: LinkId,
        candidate: Value,
    },
}

impl LinkEvent {
    pub fn peer(&self) -> &str {
        match self {
            LinkEvent::Opened { peer, .. }
            | LinkEvent::Data { peer, .. }
            | LinkEvent::Closed { peer, .. }
            | LinkEvent::LocalCandidate { peer, .. } => peer,
        }
    }

    pub fn link(&self) -> LinkId {
        match self {
            LinkEvent::Opened { link, .. }
            | LinkEvent::Data { link, .. }
            | LinkEvent::Closed { link, .. }
            | LinkEvent::LocalCandidate { link, .. } => *link,
        }
    }
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::Opened { peer, link } => write!(f, "Opened {{ peer: {}, link: {} }}", peer, link),
            LinkEvent::Data {
                peer,
                link,
                payload,
            } => write!(
                f,
                "Data {{ peer: {}, link: {}, len: {} }}",
                peer,
                link,
                payload.len()
            ),
            LinkEvent::Closed { peer, link } => write!(f, "Closed {{ peer: {}, link: {} }}", peer, link),
            LinkEvent::LocalCandidate { peer, link, .. } => {
                write!(f, "LocalCandidate {{ peer: {}, link: {} }}", peer, link)
            }
        }
    }
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Unreachable after {0} reconnect attempts")]
    Unreachable(u32),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Creates direct links. One connector serves every peer of an endpoint.
#[async_trait]
pub trait DirectConnector: Send + Sync {
    /// Start a link as the initiator. Returns the link and the offer
    /// descriptor to send to `peer`.
    async fn offer(&self, peer: &str) -> Result<(Box<dyn DirectLink>, Value), TransportError>;

    /// Accept `offer` from `peer`. Returns the link and the answer
    /// descriptor to send back.
    async fn answer(
        &self,
        peer: &str,
        offer: &Value,
    ) -> Result<(Box<dyn DirectLink>, Value), TransportError>;
}

/// One direct link attempt to one peer
#[async_trait]
pub trait DirectLink: Send + Sync {
    fn id(&self) -> LinkId;

    /// Complete the handshake with the responder's answer (initiator only)
    async fn apply_answer(&self, answer: &Value) -> Result<(), TransportError>;

    /// Feed a remote candidate
    async fn add_candidate(&self, candidate: &Value) -> Result<(), TransportError>;

    /// Send one frame
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Tear down. No events for this link are emitted afterwards.
    fn close(&self);
}
