//! Rendezvous Relay
//!
//! An address-keyed switchboard: parties register an address, then hand the
//! relay negotiation (and fallback message) frames addressed to each other.
//! The relay forwards, it never stores and it never reads payloads.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod router;

pub use client::{RelayLink, RelayLinkConfig};
pub use protocol::{OnlineUser, RelayError, RelayEvent, RelayRequest, REGISTERED_MESSAGE};
pub use registry::{ConnectionId, Registry};
pub use router::{RelayPeer, Router};
