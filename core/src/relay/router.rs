//! Relay Router — validates addressing and forwards frames between parties
//!
//! The router is synchronous: every send is a non-blocking `try_send` into
//! the target connection's bounded outbox, so a slow party never stalls the
//! loop of the party talking to it.

use super::protocol::{OnlineUser, RelayError, RelayEvent, RelayRequest, REGISTERED_MESSAGE};
use super::registry::{ConnectionId, Registry};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Server-side handle to one connected party.
///
/// Cloning shares the same outbox and eviction signal.
#[derive(Debug, Clone)]
pub struct RelayPeer {
    id: ConnectionId,
    outbox: mpsc::Sender<String>,
    evicted: Arc<Notify>,
}

impl RelayPeer {
    pub fn new(id: ConnectionId, outbox: mpsc::Sender<String>) -> Self {
        Self {
            id,
            outbox,
            evicted: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Resolves once the router has evicted this connection.
    ///
    /// The permit is stored, so an eviction that happens before anyone waits
    /// is not lost.
    pub async fn evicted(&self) {
        self.evicted.notified().await
    }

    fn deliver(&self, frame: String) -> Result<(), RelayError> {
        self.outbox
            .try_send(frame)
            .map_err(|_| RelayError::TargetUnavailable)
    }

    fn evict(&self) {
        self.evicted.notify_one();
    }
}

/// Frame router over an injected registry
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry<RelayPeer>>,
}

impl Router {
    pub fn new(registry: Arc<Registry<RelayPeer>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry<RelayPeer>> {
        &self.registry
    }

    /// Handle one raw frame from `peer`.
    ///
    /// Any failure is answered with a single `error` frame to the sender and
    /// also returned; the connection stays usable either way.
    pub fn handle_frame(&self, peer: &RelayPeer, raw: &str) -> Result<(), RelayError> {
        let result = RelayRequest::decode(raw).and_then(|request| self.dispatch(peer, request));

        if let Err(err) = &result {
            debug!("Rejecting frame from {}: {}", peer.id(), err);
            self.reply(peer, &RelayEvent::error(err));
        }
        result
    }

    /// Handle a binary WebSocket message. UTF-8 payloads are treated as
    /// text frames; anything else is `InvalidFormat`.
    pub fn handle_binary(&self, peer: &RelayPeer, raw: &[u8]) -> Result<(), RelayError> {
        match std::str::from_utf8(raw) {
            Ok(text) => self.handle_frame(peer, text),
            Err(_) => {
                let err = RelayError::InvalidFormat;
                self.reply(peer, &RelayEvent::error(&err));
                Err(err)
            }
        }
    }

    /// Bind `address` to `peer` and confirm with a `registered` frame
    pub fn register(&self, peer: &RelayPeer, address: &str) {
        if let Some(displaced) = self.registry.register(address, peer.id(), peer.clone()) {
            info!("User {} reconnected, displacing {}", address, displaced);
        } else {
            info!("User registered: {}", address);
        }

        self.reply(
            peer,
            &RelayEvent::Registered {
                address: address.to_string(),
                message: REGISTERED_MESSAGE.to_string(),
            },
        );
    }

    /// Forget `peer` after its transport closed
    pub fn disconnect(&self, peer: &RelayPeer) {
        if let Some(address) = self.registry.unregister(peer.id()) {
            info!("User disconnected: {}", address);
        }
    }

    /// Snapshot of the parties currently registered
    pub fn online_users(&self) -> Vec<OnlineUser> {
        let now = crate::now_millis();
        self.registry
            .addresses()
            .into_iter()
            .map(|address| OnlineUser {
                address,
                is_online: true,
                last_seen: now,
            })
            .collect()
    }

    fn dispatch(&self, peer: &RelayPeer, request: RelayRequest) -> Result<(), RelayError> {
        match request {
            RelayRequest::Register { address } => {
                let address = address
                    .filter(|a| !a.is_empty())
                    .ok_or(RelayError::MissingAddress)?;
                self.register(peer, &address);
                Ok(())
            }
            other => self.forward(peer, other),
        }
    }

    fn forward(&self, peer: &RelayPeer, request: RelayRequest) -> Result<(), RelayError> {
        let kind = request.message_type();
        let to = request.target().ok_or(RelayError::TargetNotFound)?.to_string();
        let target = self.registry.lookup(&to).ok_or(RelayError::TargetNotFound)?;
        let from = self.registry.address_of(peer.id());

        let event = request
            .into_forwarded(from.clone())
            .ok_or(RelayError::UnknownMessageType)?;
        let frame = event.encode()?;

        if let Err(err) = target.deliver(frame) {
            warn!("Outbox for {} is full or closed, evicting {}", to, target.id());
            self.registry.unregister(target.id());
            target.evict();
            return Err(err);
        }

        debug!(
            "Forwarded {} from {} to {}",
            kind,
            from.as_deref().unwrap_or("<unregistered>"),
            to
        );
        Ok(())
    }

    fn reply(&self, peer: &RelayPeer, event: &RelayEvent) {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {} reply: {}", event.message_type(), e);
                return;
            }
        };
        if peer.deliver(frame).is_err() {
            warn!("Dropping {} reply to {}: outbox full", event.message_type(), peer.id());
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn router() -> Router {
        Router::new(Arc::new(Registry::new()))
    }

    fn connect(router: &Router, capacity: usize) -> (RelayPeer, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (RelayPeer::new(router.registry().allocate_id(), tx), rx)
    }

    fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let raw = rx.try_recv().expect("expected a frame");
        serde_json::from_str(&raw).expect("frame is JSON")
    }

    #[test]
    fn test_register_replies_registered() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);

        router
            .handle_frame(&alice, r#"{"type":"register","address":"ALICE"}"#)
            .unwrap();

        assert_eq!(
            next_frame(&mut alice_rx),
            json!({"type": "registered", "address": "ALICE", "message": REGISTERED_MESSAGE})
        );
        assert!(router.registry().lookup("ALICE").is_some());
    }

    #[test]
    fn test_register_without_address() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);

        let result = router.handle_frame(&alice, r#"{"type":"register"}"#);
        assert_eq!(result, Err(RelayError::MissingAddress));
        assert_eq!(
            next_frame(&mut alice_rx),
            json!({"type": "error", "message": "Address required for registration"})
        );

        let result = router.handle_frame(&alice, r#"{"type":"register","address":""}"#);
        assert_eq!(result, Err(RelayError::MissingAddress));
        assert!(router.registry().is_empty());
    }

    #[test]
    fn test_forward_answer_tags_sender() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);
        let (bob, mut bob_rx) = connect(&router, 8);
        router.register(&alice, "ALICE");
        router.register(&bob, "BOB");
        next_frame(&mut alice_rx);
        next_frame(&mut bob_rx);

        router
            .handle_frame(
                &alice,
                r#"{"type":"answer","to":"BOB","answer":{"sdp":"y"},"from":"spoofed"}"#,
            )
            .unwrap();

        assert_eq!(
            next_frame(&mut bob_rx),
            json!({"type": "answer", "from": "ALICE", "answer": {"sdp": "y"}})
        );
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_target() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);
        router.register(&alice, "ALICE");
        next_frame(&mut alice_rx);

        let result = router.handle_frame(
            &alice,
            r#"{"type":"message","to":"ghost","encrypted":"00","iv":"00","hash":"00"}"#,
        );

        assert_eq!(result, Err(RelayError::TargetNotFound));
        assert_eq!(
            next_frame(&mut alice_rx),
            json!({"type": "error", "message": "Target user not found"})
        );
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_payloadless_message_to_unknown_target() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);
        router.register(&alice, "ALICE");
        next_frame(&mut alice_rx);

        let result = router.handle_frame(&alice, r#"{"type":"message","to":"ghost"}"#);

        assert_eq!(result, Err(RelayError::TargetNotFound));
        assert_eq!(
            next_frame(&mut alice_rx),
            json!({"type": "error", "message": "Target user not found"})
        );
    }

    #[test]
    fn test_payloadless_message_is_forwarded() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);
        let (bob, mut bob_rx) = connect(&router, 8);
        router.register(&alice, "ALICE");
        router.register(&bob, "BOB");
        next_frame(&mut alice_rx);
        next_frame(&mut bob_rx);

        router
            .handle_frame(&alice, r#"{"type":"message","to":"BOB","hash":"ff"}"#)
            .unwrap();

        let frame = next_frame(&mut bob_rx);
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["from"], "ALICE");
        assert_eq!(frame["hash"], "ff");
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_missing_target_field() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);

        let result = router.handle_frame(&alice, r#"{"type":"ice-candidate","candidate":{}}"#);
        assert_eq!(result, Err(RelayError::TargetNotFound));
        assert_eq!(next_frame(&mut alice_rx)["message"], "Target user not found");
    }

    #[test]
    fn test_unknown_type_keeps_connection_usable() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);

        let result = router.handle_frame(&alice, r#"{"type":"bogus"}"#);
        assert_eq!(result, Err(RelayError::UnknownMessageType));
        assert_eq!(
            next_frame(&mut alice_rx),
            json!({"type": "error", "message": "Unknown message type"})
        );

        router
            .handle_frame(&alice, r#"{"type":"register","address":"ALICE"}"#)
            .unwrap();
        assert_eq!(next_frame(&mut alice_rx)["type"], "registered");
    }

    #[test]
    fn test_malformed_payload() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);

        let result = router.handle_frame(&alice, "{not json");
        assert_eq!(result, Err(RelayError::InvalidFormat));
        assert_eq!(
            next_frame(&mut alice_rx),
            json!({"type": "error", "message": "Invalid message format"})
        );
    }

    #[test]
    fn test_binary_frames() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);

        router
            .handle_binary(&alice, br#"{"type":"register","address":"ALICE"}"#)
            .unwrap();
        assert_eq!(next_frame(&mut alice_rx)["type"], "registered");

        let result = router.handle_binary(&alice, &[0xff, 0xfe, 0x00]);
        assert_eq!(result, Err(RelayError::InvalidFormat));
        assert_eq!(next_frame(&mut alice_rx)["message"], "Invalid message format");
    }

    #[test]
    fn test_unregistered_sender_forwards_null_from() {
        let router = router();
        let (stranger, _stranger_rx) = connect(&router, 8);
        let (bob, mut bob_rx) = connect(&router, 8);
        router.register(&bob, "BOB");
        next_frame(&mut bob_rx);

        router
            .handle_frame(&stranger, r#"{"type":"contact-request","to":"BOB"}"#)
            .unwrap();
        assert_eq!(
            next_frame(&mut bob_rx),
            json!({"type": "contact-request", "from": null})
        );
    }

    #[test]
    fn test_disconnect_removes_registration() {
        let router = router();
        let (alice, _alice_rx) = connect(&router, 8);
        router.register(&alice, "ALICE");

        router.disconnect(&alice);
        router.disconnect(&alice);

        assert!(router.registry().lookup("ALICE").is_none());
    }

    #[test]
    fn test_full_target_is_evicted() {
        let router = router();
        let (alice, mut alice_rx) = connect(&router, 8);
        let (bob, mut bob_rx) = connect(&router, 1);
        router.register(&alice, "ALICE");
        // Bob's single slot is taken by his registration confirmation.
        router.register(&bob, "BOB");
        next_frame(&mut alice_rx);

        let result = router.handle_frame(&alice, r#"{"type":"contact-request","to":"BOB"}"#);

        assert_eq!(result, Err(RelayError::TargetUnavailable));
        assert_eq!(next_frame(&mut alice_rx)["message"], "Target user not reachable");
        assert!(router.registry().lookup("BOB").is_none());
        assert_eq!(next_frame(&mut bob_rx)["type"], "registered");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_eviction_signal_is_not_lost() {
        let router = router();
        let (alice, _alice_rx) = connect(&router, 8);
        let (bob, _bob_rx) = connect(&router, 1);
        router.register(&alice, "ALICE");
        router.register(&bob, "BOB");

        let _ = router.handle_frame(&alice, r#"{"type":"contact-request","to":"BOB"}"#);

        // Eviction fired before anyone was waiting.
        tokio::time::timeout(std::time::Duration::from_secs(1), bob.evicted())
            .await
            .expect("eviction should be observable");
    }

    #[test]
    fn test_online_users() {
        let router = router();
        let (alice, _a) = connect(&router, 8);
        let (bob, _b) = connect(&router, 8);
        router.register(&alice, "ALICE");
        router.register(&bob, "BOB");

        let online = router.online_users();
        let addresses: Vec<&str> = online.iter().map(|u| u.address.as_str()).collect();
        assert_eq!(addresses, vec!["ALICE", "BOB"]);
        assert!(online.iter().all(|u| u.is_online));
    }
}
