// Relay server — WebSocket listener in front of the core router
//
// One socket per party. Each socket gets a bounded outbox drained by its
// own writer task; the reader loop feeds frames to the router and stops
// when the peer closes or the router evicts it.

use futures::{SinkExt, StreamExt};
use parley_core::relay::{RelayPeer, Registry, Router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use warp::ws::{Message, WebSocket};
use warp::Filter;

/// Relay server settings
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub addr: SocketAddr,
    /// Frames queued per connection before the connection is evicted
    pub outbound_buffer: usize,
}

// ============================================================================
// SERVER START
// ============================================================================

/// Serve until the process exits
pub async fn run(config: RelayServerConfig) {
    let router = Router::new(Arc::new(Registry::new()));

    info!(
        "Relay listening on {} (outbound buffer {} frames)",
        config.addr, config.outbound_buffer
    );
    warp::serve(routes(router, config.outbound_buffer))
        .run(config.addr)
        .await;
}

/// `GET /` with a WebSocket upgrade, plus `GET /api/online`
pub fn routes(
    router: Router,
    outbound_buffer: usize,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let outbound_buffer = outbound_buffer.max(1);

    let router_filter = warp::any().map({
        let router = router.clone();
        move || router.clone()
    });

    // 1. WebSocket at /, `?address=` registers on connect
    let ws_route = warp::path::end()
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(router_filter.clone())
        .map(
            move |ws: warp::ws::Ws, query: HashMap<String, String>, router: Router| {
                ws.on_upgrade(move |socket| {
                    handle_connection(socket, query.get("address").cloned(), router, outbound_buffer)
                })
            },
        );

    // 2. Online users
    let online_route = warp::path!("api" / "online")
        .and(warp::get())
        .and(router_filter)
        .map(|router: Router| warp::reply::json(&router.online_users()));

    ws_route.or(online_route)
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

async fn handle_connection(
    ws: WebSocket,
    address: Option<String>,
    router: Router,
    outbound_buffer: usize,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (outbox_tx, outbox_rx) = mpsc::channel::<String>(outbound_buffer);
    let peer = RelayPeer::new(router.registry().allocate_id(), outbox_tx);

    debug!("{} connected", peer.id());

    // Task to drain the outbox -> WebSocket
    let writer = tokio::spawn(async move {
        let mut frames = ReceiverStream::new(outbox_rx);
        while let Some(frame) = frames.next().await {
            if ws_tx.send(Message::text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    if let Some(address) = address.filter(|a| !a.is_empty()) {
        router.register(&peer, &address);
    }

    // Handle WebSocket -> Router
    loop {
        tokio::select! {
            _ = peer.evicted() => {
                warn!("{} evicted: outbox full", peer.id());
                break;
            }
            incoming = ws_rx.next() => match incoming {
                Some(Ok(msg)) => {
                    if msg.is_close() {
                        break;
                    }
                    if let Ok(text) = msg.to_str() {
                        let _ = router.handle_frame(&peer, text);
                    } else if msg.is_binary() {
                        let _ = router.handle_binary(&peer, msg.as_bytes());
                    }
                }
                Some(Err(e)) => {
                    debug!("{} socket error: {}", peer.id(), e);
                    break;
                }
                None => break,
            },
        }
    }

    router.disconnect(&peer);
    writer.abort();
    debug!("{} closed", peer.id());
}
