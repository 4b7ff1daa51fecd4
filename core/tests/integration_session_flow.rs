// Integration tests for the full two-party flow
//
// Two endpoints talk through an in-process router (standing in for the
// relay server's socket plumbing) and open real TCP direct links on
// loopback. Covers:
// - offer/answer negotiation carrying the session key
// - a message over the established direct channel, verified on arrival
// - relay fallback before the channel is up
// - relay errors for unknown targets

use parley_core::{
    fingerprint, Endpoint, EndpointEvent, EndpointHandle, MemoryAnchor, RelayEvent, RelayPeer,
    RelayRequest, Registry, Router, SessionState, TcpConnector, TcpConnectorConfig,
    Verification, Via,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Party {
    handle: EndpointHandle,
    events: mpsc::UnboundedReceiver<EndpointEvent>,
    anchor: Arc<MemoryAnchor>,
}

/// Wire one endpoint to the router through channel pumps
fn join(router: &Router, address: &str) -> Party {
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<RelayRequest>();
    let (relay_tx, relay_rx) = mpsc::channel::<RelayEvent>(64);
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(64);
    let (link_tx, link_rx) = mpsc::unbounded_channel();

    let peer = RelayPeer::new(router.registry().allocate_id(), outbox_tx);

    // Party -> relay
    let inbound_router = router.clone();
    let inbound_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(request) = signal_rx.recv().await {
            let text = request.encode().unwrap();
            let _ = inbound_router.handle_frame(&inbound_peer, &text);
        }
        inbound_router.disconnect(&inbound_peer);
    });

    // Relay -> party
    tokio::spawn(async move {
        while let Some(text) = outbox_rx.recv().await {
            let event = RelayEvent::decode(&text).unwrap();
            if relay_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    let connector = TcpConnector::new(
        TcpConnectorConfig {
            bind_host: "127.0.0.1".to_string(),
            ..Default::default()
        },
        link_tx,
    );
    let anchor = Arc::new(MemoryAnchor::new());
    let (endpoint, events) = Endpoint::new(address, Arc::new(connector), signal_tx, anchor.clone());
    router.register(&peer, address);

    let (handle, _task) = endpoint.spawn(relay_rx, link_rx);
    Party {
        handle,
        events,
        anchor,
    }
}

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<EndpointEvent>, mut pred: F) -> EndpointEvent
where
    F: FnMut(&EndpointEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("endpoint stopped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for endpoint event")
}

fn connected(peer: &'static str) -> impl FnMut(&EndpointEvent) -> bool {
    move |e| {
        matches!(e, EndpointEvent::SessionChanged { peer: p, state: SessionState::Connected } if p == peer)
    }
}

#[tokio::test]
async fn test_offer_answer_then_direct_message() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init()
        .ok();

    let router = Router::new(Arc::new(Registry::new()));
    let mut alice = join(&router, "ALICE");
    let mut bob = join(&router, "BOB");

    wait_for(&mut alice.events, |e| matches!(e, EndpointEvent::Registered { .. })).await;
    wait_for(&mut bob.events, |e| matches!(e, EndpointEvent::Registered { .. })).await;

    alice.handle.connect("BOB").await.unwrap();

    wait_for(&mut alice.events, connected("BOB")).await;
    wait_for(&mut bob.events, connected("ALICE")).await;

    let sent = alice.handle.send("BOB", "hi").await.unwrap();

    let event = wait_for(&mut bob.events, |e| matches!(e, EndpointEvent::MessageReceived { .. })).await;
    let EndpointEvent::MessageReceived { message, via } = event else {
        unreachable!()
    };

    assert_eq!(via, Via::Direct);
    assert_eq!(message.content, "hi");
    assert_eq!(message.from, "ALICE");
    assert_eq!(message.hash, sent.hash);
    assert_eq!(fingerprint(&message.fields()), sent.hash);

    // Both ends hold the same session key.
    let alice_sessions = alice.handle.sessions().await.unwrap();
    let bob_sessions = bob.handle.sessions().await.unwrap();
    assert_eq!(alice_sessions[0].state, SessionState::Connected);
    assert_eq!(bob_sessions[0].state, SessionState::Connected);

    // The sender's anchor eventually holds the commitment.
    let mut outcome = Verification::Unanchored;
    for _ in 0..50 {
        outcome = alice.handle.verify(&sent.hash, sent.fields()).await.unwrap();
        if outcome == Verification::Anchored {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(outcome, Verification::Anchored);

    // The receiver recomputes the hash but never committed it.
    let outcome = bob.handle.verify(&sent.hash, message.fields()).await.unwrap();
    assert_eq!(outcome, Verification::Unanchored);
    assert!(bob.anchor.is_empty());
}

#[tokio::test]
async fn test_reply_flows_both_ways() {
    let router = Router::new(Arc::new(Registry::new()));
    let mut alice = join(&router, "ALICE");
    let mut bob = join(&router, "BOB");

    alice.handle.connect("BOB").await.unwrap();
    wait_for(&mut alice.events, connected("BOB")).await;
    wait_for(&mut bob.events, connected("ALICE")).await;

    bob.handle.send("ALICE", "hello back").await.unwrap();
    let event = wait_for(&mut alice.events, |e| matches!(e, EndpointEvent::MessageReceived { .. })).await;

    assert!(matches!(
        event,
        EndpointEvent::MessageReceived { ref message, via: Via::Direct } if message.content == "hello back"
    ));
}

#[tokio::test]
async fn test_close_tears_down_both_sides() {
    let router = Router::new(Arc::new(Registry::new()));
    let mut alice = join(&router, "ALICE");
    let mut bob = join(&router, "BOB");

    alice.handle.connect("BOB").await.unwrap();
    wait_for(&mut alice.events, connected("BOB")).await;
    wait_for(&mut bob.events, connected("ALICE")).await;

    assert!(alice.handle.close("BOB").await.unwrap());

    wait_for(&mut bob.events, |e| {
        matches!(e, EndpointEvent::SessionChanged { state: SessionState::Closed, .. })
    })
    .await;
    assert!(bob.handle.sessions().await.unwrap().is_empty());

    // Without a channel the next message goes through the relay.
    let sent = bob.handle.send("ALICE", "still there?").await.unwrap();
    let event = wait_for(&mut alice.events, |e| matches!(e, EndpointEvent::MessageReceived { .. })).await;
    assert!(matches!(
        event,
        EndpointEvent::MessageReceived { ref message, via: Via::Relay } if message.hash == sent.hash
    ));
}

#[tokio::test]
async fn test_unknown_target_reports_relay_error() {
    let router = Router::new(Arc::new(Registry::new()));
    let mut alice = join(&router, "ALICE");

    alice.handle.connect("ghost").await.unwrap();

    let event = wait_for(&mut alice.events, |e| matches!(e, EndpointEvent::RelayError { .. })).await;
    assert_eq!(
        event,
        EndpointEvent::RelayError {
            message: "Target user not found".to_string()
        }
    );
}

#[tokio::test]
async fn test_contact_request_delivered() {
    let router = Router::new(Arc::new(Registry::new()));
    let alice = join(&router, "ALICE");
    let mut bob = join(&router, "BOB");

    alice.handle.contact_request("BOB").await.unwrap();

    let event = wait_for(&mut bob.events, |e| matches!(e, EndpointEvent::ContactRequest { .. })).await;
    assert_eq!(
        event,
        EndpointEvent::ContactRequest {
            from: Some("ALICE".to_string())
        }
    );
}

#[tokio::test]
async fn test_stalled_peer_does_not_freeze_endpoint() {
    use tokio::io::AsyncWriteExt;

    let router = Router::new(Arc::new(Registry::new()));
    let mut alice = join(&router, "ALICE");

    // BOB is registered by hand and opens a direct link it never reads.
    let (bob_tx, mut bob_rx) = mpsc::channel::<String>(1024);
    let bob = RelayPeer::new(router.registry().allocate_id(), bob_tx);
    router.register(&bob, "BOB");

    alice.handle.connect("BOB").await.unwrap();
    let offer = loop {
        let raw = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv())
            .await
            .expect("no offer for BOB")
            .expect("relay outbox closed");
        if let RelayEvent::Offer { offer, .. } = RelayEvent::decode(&raw).unwrap() {
            break offer;
        }
    };

    let mut stalled = tokio::net::TcpStream::connect(offer["addr"].as_str().unwrap())
        .await
        .unwrap();
    stalled
        .write_all(format!("{}\n", offer["token"].as_str().unwrap()).as_bytes())
        .await
        .unwrap();
    wait_for(&mut alice.events, connected("BOB")).await;

    let content = "x".repeat(60 * 1024);
    let mut fell_back = false;
    for _ in 0..500 {
        tokio::time::timeout(Duration::from_secs(2), alice.handle.send("BOB", &content))
            .await
            .expect("send stalled the endpoint")
            .unwrap();

        while let Ok(event) = alice.events.try_recv() {
            if matches!(event, EndpointEvent::MessageSent { via: Via::Relay, .. }) {
                fell_back = true;
            }
        }
        if fell_back {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(fell_back);

    // The endpoint still answers, and the stuck session is gone.
    let sessions = tokio::time::timeout(Duration::from_secs(2), alice.handle.sessions())
        .await
        .expect("endpoint stopped responding")
        .unwrap();
    assert!(sessions.is_empty());
}

