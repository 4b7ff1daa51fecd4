// Transport module — direct peer-to-peer links negotiated through the relay

pub mod abstraction;
pub mod tcp;

pub use abstraction::{DirectConnector, DirectLink, LinkEvent, LinkId, TransportError};
pub use tcp::{TcpConnector, TcpConnectorConfig};
