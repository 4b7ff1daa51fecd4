// Parley Core — Rendezvous relay, peer negotiation and message integrity
//
// Two parties, known only by opaque addresses, meet at a relay, negotiate a
// direct channel, and from then on exchange messages the relay never sees.
// Every message carries a fingerprint anyone holding the plaintext can
// recompute, so tamper-evidence does not depend on the path it travelled.

pub mod anchor;
pub mod crypto;
pub mod endpoint;
pub mod message;
pub mod relay;
pub mod session;
pub mod transport;

use thiserror::Error;

pub use anchor::{Anchor, AnchorError, CommitmentRecord, MemoryAnchor, Verification};
pub use crypto::{decrypt, encrypt, fingerprint, CryptoError, SessionKey};
pub use endpoint::{Command, Endpoint, EndpointEvent, EndpointHandle, Via};
pub use message::{CodecError, Message, MessageFields, SealedMessage};
pub use relay::{
    RelayError, RelayEvent, RelayLink, RelayLinkConfig, RelayPeer, RelayRequest, Registry, Router,
};
pub use session::{KeyStore, Negotiator, Role, SessionError, SessionState, SessionSummary};
pub use transport::{
    DirectConnector, DirectLink, LinkEvent, LinkId, TcpConnector, TcpConnectorConfig,
    TransportError,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Top-level error, grouped by how the caller is expected to recover.
///
/// None of these are fatal: addressing and protocol faults are answered with
/// an error frame, crypto faults fail a single message, and transport faults
/// tear down the affected session only.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Addressing error: {0}")]
    Addressing(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Anchor error: {0}")]
    Anchor(#[from] AnchorError),
}

impl From<RelayError> for ParleyError {
    fn from(err: RelayError) -> Self {
        if err.is_addressing() {
            ParleyError::Addressing(err.to_string())
        } else {
            ParleyError::Protocol(err.to_string())
        }
    }
}

impl From<CodecError> for ParleyError {
    fn from(err: CodecError) -> Self {
        ParleyError::Protocol(err.to_string())
    }
}

impl From<SessionError> for ParleyError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Transport(e) => ParleyError::Transport(e),
            SessionError::Crypto(e) => ParleyError::Crypto(e),
            SessionError::RelayClosed => ParleyError::Transport(TransportError::Closed),
            SessionError::NoSession(peer) => ParleyError::Addressing(format!("no session for {peer}")),
            other => ParleyError::Protocol(other.to_string()),
        }
    }
}

/// Current Unix time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
