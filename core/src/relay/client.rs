//! Relay Link — a party's WebSocket connection to the relay
//!
//! The link registers on every (re)connect, pumps outgoing requests from a
//! queue, and surfaces decoded relay frames on a channel. After an abnormal
//! close it reconnects with exponential backoff up to a bounded number of
//! attempts; a normal close or a dropped request queue ends it for good.

use super::protocol::{RelayEvent, RelayRequest};
use crate::transport::TransportError;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Relay link configuration
#[derive(Debug, Clone)]
pub struct RelayLinkConfig {
    /// Relay WebSocket URL, e.g. `ws://127.0.0.1:8080`
    pub url: String,
    /// Delay before the first reconnect after an abnormal close
    pub reconnect_delay: Duration,
    /// Upper bound for the doubled reconnect delay
    pub max_reconnect_delay: Duration,
    /// Consecutive failed attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Capacity of the inbound event channel
    pub event_buffer: usize,
}

impl Default for RelayLinkConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            event_buffer: 256,
        }
    }
}

impl RelayLinkConfig {
    /// Delay before reconnect attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

/// How a single connected session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Our request queue was dropped
    Shutdown,
    /// Relay closed with 1000/1005
    NormalClose,
    /// Anything else: reconnect
    Abnormal,
}

/// Handle to a running relay link
pub struct RelayLink {
    requests: mpsc::UnboundedSender<RelayRequest>,
    task: JoinHandle<Result<(), TransportError>>,
}

impl RelayLink {
    /// Start the link for `address`. Returns the link handle and the stream
    /// of frames the relay delivers.
    pub fn spawn(config: RelayLinkConfig, address: String) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        let task = tokio::spawn(run(config, address, request_rx, event_tx));

        (
            Self {
                requests: request_tx,
                task,
            },
            event_rx,
        )
    }

    /// Queue for frames to send to the relay
    pub fn requests(&self) -> mpsc::UnboundedSender<RelayRequest> {
        self.requests.clone()
    }

    /// Wait for the link to finish. Drop every request sender first.
    pub async fn join(self) -> Result<(), TransportError> {
        let Self { requests, task } = self;
        drop(requests);
        task.await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
    }
}

async fn run(
    config: RelayLinkConfig,
    address: String,
    mut requests: mpsc::UnboundedReceiver<RelayRequest>,
    events: mpsc::Sender<RelayEvent>,
) -> Result<(), TransportError> {
    let mut failures = 0u32;

    loop {
        match connect_async(config.url.as_str()).await {
            Ok((socket, _response)) => {
                info!("Connected to relay {}", config.url);
                failures = 0;

                match drive(socket, &address, &mut requests, &events).await {
                    Ok(SessionEnd::Shutdown) => return Ok(()),
                    Ok(SessionEnd::NormalClose) => {
                        info!("Relay closed the connection normally");
                        return Ok(());
                    }
                    Ok(SessionEnd::Abnormal) => warn!("Relay connection dropped"),
                    Err(e) => warn!("Relay connection failed: {}", e),
                }
            }
            Err(e) => warn!("Could not reach relay {}: {}", config.url, e),
        }

        failures += 1;
        if failures > config.max_reconnect_attempts {
            return Err(TransportError::Unreachable(config.max_reconnect_attempts));
        }

        let delay = config.backoff(failures);
        info!(
            "Reconnecting to relay in {:?} (attempt {}/{})",
            delay, failures, config.max_reconnect_attempts
        );
        tokio::time::sleep(delay).await;
    }
}

async fn drive(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    address: &str,
    requests: &mut mpsc::UnboundedReceiver<RelayRequest>,
    events: &mpsc::Sender<RelayEvent>,
) -> Result<SessionEnd, TransportError> {
    let (mut sink, mut stream) = socket.split();

    let register = RelayRequest::Register {
        address: Some(address.to_string()),
    };
    send(&mut sink, &register).await?;

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => send(&mut sink, &request).await?,
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match RelayEvent::decode(&text) {
                    Ok(event) => {
                        debug!("Relay delivered {}", event.message_type());
                        if events.send(event).await.is_err() {
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    Err(e) => warn!("Skipping undecodable relay frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame
                        .map(|f| matches!(f.code, CloseCode::Normal | CloseCode::Status))
                        .unwrap_or(true);
                    return Ok(if normal { SessionEnd::NormalClose } else { SessionEnd::Abnormal });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
                None => return Ok(SessionEnd::Abnormal),
            },
        }
    }
}

async fn send<S>(sink: &mut S, request: &RelayRequest) -> Result<(), TransportError>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = request
        .encode()
        .map_err(|e| TransportError::InvalidPayload(e.to_string()))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================
