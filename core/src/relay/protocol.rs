//! Relay wire protocol — JSON frames exchanged with the relay
//!
//! One JSON object per WebSocket message, discriminated by `type`. Frames
//! sent by a party carry `to`; the relay rewrites them into frames carrying
//! `from` and never touches the payload fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Confirmation text sent with every `registered` frame
pub const REGISTERED_MESSAGE: &str = "Successfully registered for signaling";

/// Request types the relay understands
pub const REQUEST_TYPES: &[&str] = &[
    "register",
    "offer",
    "answer",
    "ice-candidate",
    "message",
    "contact-request",
];

/// Relay protocol errors.
///
/// The `Display` text of each variant is exactly what goes back to the
/// sender inside an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Address required for registration")]
    MissingAddress,
    #[error("Target user not found")]
    TargetNotFound,
    #[error("Target user not reachable")]
    TargetUnavailable,
    #[error("Unknown message type")]
    UnknownMessageType,
    #[error("Invalid message format")]
    InvalidFormat,
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl RelayError {
    /// Whether this error is about who a frame was for rather than what it said
    pub fn is_addressing(&self) -> bool {
        matches!(
            self,
            RelayError::MissingAddress | RelayError::TargetNotFound | RelayError::TargetUnavailable
        )
    }
}

/// A frame sent by a party to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayRequest {
    /// Bind the sending connection to an address
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    /// Session offer, optionally carrying the hex-encoded session key
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default)]
        offer: Value,
        #[serde(
            rename = "encryptionKey",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        encryption_key: Option<String>,
    },
    /// Session answer
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default)]
        answer: Value,
    },
    /// Transport candidate for an in-progress negotiation
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default)]
        candidate: Value,
    },
    /// Application message relayed because no direct channel exists
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default)]
        encrypted: String,
        #[serde(default)]
        iv: String,
        #[serde(default)]
        hash: String,
    },
    /// Ask the target to add the sender as a contact
    ContactRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
}

impl RelayRequest {
    /// Decode a raw frame.
    ///
    /// Anything that is not JSON is `InvalidFormat`. JSON whose `type` is
    /// missing or unrecognised is `UnknownMessageType`. A known type whose
    /// fields do not fit is `InvalidFormat` again.
    pub fn decode(raw: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| RelayError::InvalidFormat)?;

        match value.get("type").and_then(Value::as_str) {
            Some(kind) if REQUEST_TYPES.contains(&kind) => {
                serde_json::from_value(value).map_err(|_| RelayError::InvalidFormat)
            }
            _ => Err(RelayError::UnknownMessageType),
        }
    }

    /// Encode as a single JSON text frame
    pub fn encode(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Encoding(e.to_string()))
    }

    /// The address this frame should be forwarded to, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            RelayRequest::Register { .. } => None,
            RelayRequest::Offer { to, .. }
            | RelayRequest::Answer { to, .. }
            | RelayRequest::IceCandidate { to, .. }
            | RelayRequest::Message { to, .. }
            | RelayRequest::ContactRequest { to, .. } => to.as_deref(),
        }
    }

    /// Wire name of the frame type
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayRequest::Register { .. } => "register",
            RelayRequest::Offer { .. } => "offer",
            RelayRequest::Answer { .. } => "answer",
            RelayRequest::IceCandidate { .. } => "ice-candidate",
            RelayRequest::Message { .. } => "message",
            RelayRequest::ContactRequest { .. } => "contact-request",
        }
    }

    /// Rewrite a party's request into the frame its target receives.
    ///
    /// `sender` is the sender's registered address. Payload fields move
    /// across untouched. Returns `None` for `register`, which is never
    /// forwarded.
    pub fn into_forwarded(self, sender: Option<String>) -> Option<RelayEvent> {
        let event = match self {
            RelayRequest::Register { .. } => return None,
            RelayRequest::Offer {
                offer,
                encryption_key,
                ..
            } => RelayEvent::Offer {
                from: sender,
                offer,
                encryption_key,
            },
            RelayRequest::Answer { answer, .. } => RelayEvent::Answer {
                from: sender,
                answer,
            },
            RelayRequest::IceCandidate { candidate, .. } => RelayEvent::IceCandidate {
                from: sender,
                candidate,
            },
            RelayRequest::Message {
                encrypted,
                iv,
                hash,
                ..
            } => RelayEvent::Message {
                from: sender,
                encrypted,
                iv,
                hash,
            },
            // A self-declared sender wins over the registration.
            RelayRequest::ContactRequest { from, .. } => RelayEvent::ContactRequest {
                from: from.or(sender),
            },
        };
        Some(event)
    }
}

/// A frame delivered by the relay to a party
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// Registration accepted
    Registered { address: String, message: String },
    /// The previous request could not be handled
    Error { message: String },
    Offer {
        from: Option<String>,
        #[serde(default)]
        offer: Value,
        #[serde(
            rename = "encryptionKey",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        encryption_key: Option<String>,
    },
    Answer {
        from: Option<String>,
        #[serde(default)]
        answer: Value,
    },
    IceCandidate {
        from: Option<String>,
        #[serde(default)]
        candidate: Value,
    },
    Message {
        from: Option<String>,
        #[serde(default)]
        encrypted: String,
        #[serde(default)]
        iv: String,
        #[serde(default)]
        hash: String,
    },
    ContactRequest { from: Option<String> },
}

impl RelayEvent {
    /// Build the error frame for a failed request
    pub fn error(err: &RelayError) -> Self {
        RelayEvent::Error {
            message: err.to_string(),
        }
    }

    /// Decode a raw frame received from the relay
    pub fn decode(raw: &str) -> Result<Self, RelayError> {
        serde_json::from_str(raw).map_err(|_| RelayError::InvalidFormat)
    }

    /// Encode as a single JSON text frame
    pub fn encode(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Encoding(e.to_string()))
    }

    /// Wire name of the frame type
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayEvent::Registered { .. } => "registered",
            RelayEvent::Error { .. } => "error",
            RelayEvent::Offer { .. } => "offer",
            RelayEvent::Answer { .. } => "answer",
            RelayEvent::IceCandidate { .. } => "ice-candidate",
            RelayEvent::Message { .. } => "message",
            RelayEvent::ContactRequest { .. } => "contact-request",
        }
    }
}

/// Entry in the relay's online-user listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub address: String,
    pub is_online: bool,
    pub last_seen: u64,
}

// ============================================================================
// TESTS
// ============================================================================
