//! TCP direct links
//!
//! The initiator listens on an ephemeral port and puts `host:port` plus a
//! random token in its offer. The responder dials that address (or any
//! candidate address it learns later), presents the token as its first
//! line, and answers with the same token. After that each direction
//! carries newline-delimited frames.
//!
//! Outbound frames go through a bounded queue drained by the link's own
//! task, so `send` never waits on the socket. A peer that stops reading
//! fills the queue and loses the link. Inbound lines longer than
//! `max_frame_len` close the link as well.

use super::abstraction::{DirectConnector, DirectLink, LinkEvent, LinkId, TransportError};
use crate::message::codec::MAX_FRAME_SIZE;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

const TRANSPORT_NAME: &str = "tcp";
const TOKEN_LEN: usize = 16;

type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;

/// TCP connector configuration
#[derive(Debug, Clone)]
pub struct TcpConnectorConfig {
    /// Interface the initiator listens on
    pub bind_host: String,
    /// Host put in the offer's `addr`
    pub advertise_host: String,
    /// Further hosts announced as candidates
    pub extra_advertise: Vec<String>,
    /// Per-dial and handshake timeout
    pub connect_timeout: Duration,
    /// Frames queued per link before the link is dropped
    pub outbound_buffer: usize,
    /// Longest inbound line accepted, newline excluded
    pub max_frame_len: usize,
}

impl Default for TcpConnectorConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            extra_advertise: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            outbound_buffer: 64,
            max_frame_len: MAX_FRAME_SIZE,
        }
    }
}

/// Opens TCP links and reports their events on one channel
pub struct TcpConnector {
    config: TcpConnectorConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    next_link: AtomicU64,
}

impl TcpConnector {
    pub fn new(config: TcpConnectorConfig, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            config,
            events,
            next_link: AtomicU64::new(1),
        }
    }

    fn allocate_link(&self) -> LinkId {
        LinkId(self.next_link.fetch_add(1, Ordering::Relaxed))
    }

    fn shared(&self, id: LinkId, peer: &str) -> Arc<LinkShared> {
        Arc::new(LinkShared {
            id,
            peer: peer.to_string(),
            events: self.events.clone(),
            outbound_buffer: self.config.outbound_buffer.max(1),
            max_frame_len: self.config.max_frame_len,
            outbox: Mutex::new(None),
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl DirectConnector for TcpConnector {
    async fn offer(&self, peer: &str) -> Result<(Box<dyn DirectLink>, Value), TransportError> {
        let listener = TcpListener::bind((self.config.bind_host.as_str(), 0)).await?;
        let port = listener.local_addr()?.port();
        let token = random_token();
        let id = self.allocate_link();
        let shared = self.shared(id, peer);

        info!("Listening for {} on port {} ({})", peer, port, id);

        for host in &self.config.extra_advertise {
            shared.emit(LinkEvent::LocalCandidate {
                peer: peer.to_string(),
                link: id,
                candidate: json!({ "addr": format!("{}:{}", host, port) }),
            });
        }

        let task = tokio::spawn(accept_loop(
            listener,
            token.clone(),
            self.config.connect_timeout,
            Arc::clone(&shared),
        ));
        shared.set_task(task);

        let offer = json!({
            "transport": TRANSPORT_NAME,
            "addr": format!("{}:{}", self.config.advertise_host, port),
            "token": token,
        });

        let link = TcpLink {
            shared,
            expected_token: Some(token),
            candidates: None,
        };
        Ok((Box::new(link), offer))
    }

    async fn answer(
        &self,
        peer: &str,
        offer: &Value,
    ) -> Result<(Box<dyn DirectLink>, Value), TransportError> {
        let (addr, token) = parse_offer(offer)?;
        let id = self.allocate_link();
        let shared = self.shared(id, peer);
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(dial_loop(
            addr,
            candidate_rx,
            token.clone(),
            self.config.connect_timeout,
            Arc::clone(&shared),
        ));
        shared.set_task(task);

        let answer = json!({
            "transport": TRANSPORT_NAME,
            "token": token,
        });

        let link = TcpLink {
            shared,
            expected_token: None,
            candidates: Some(candidate_tx),
        };
        Ok((Box::new(link), answer))
    }
}

/// State shared between a link handle and its background task
struct LinkShared {
    id: LinkId,
    peer: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    outbound_buffer: usize,
    max_frame_len: usize,
    /// Present while the link is open
    outbox: Mutex<Option<mpsc::Sender<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkShared {
    fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    fn emit(&self, event: LinkEvent) {
        // The receiver only goes away when the endpoint shuts down.
        let _ = self.events.send(event);
    }

    fn reader(&self, read: OwnedReadHalf) -> LineReader {
        FramedRead::new(read, LinesCodec::new_with_max_length(self.max_frame_len))
    }

    /// Open the outbox, announce the link, then pump both directions until
    /// either one ends.
    async fn run(&self, writer: OwnedWriteHalf, mut reader: LineReader) {
        let (outbox, mut queued) = mpsc::channel::<String>(self.outbound_buffer);
        *self.outbox.lock() = Some(outbox);
        self.emit(LinkEvent::Opened {
            peer: self.peer.clone(),
            link: self.id,
        });

        let mut sink = FramedWrite::new(writer, LinesCodec::new());
        let outbound = async {
            while let Some(line) = queued.recv().await {
                sink.send(line).await?;
            }
            Ok::<(), tokio_util::codec::LinesCodecError>(())
        };

        let inbound = async {
            while let Some(line) = reader.next().await {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                self.emit(LinkEvent::Data {
                    peer: self.peer.clone(),
                    link: self.id,
                    payload: line.into_bytes(),
                });
            }
            Ok::<(), tokio_util::codec::LinesCodecError>(())
        };

        tokio::select! {
            result = inbound => match result {
                Ok(()) => debug!("{} to {} reached end of stream", self.id, self.peer),
                Err(e) => error!("{} to {} failed reading: {}", self.id, self.peer, e),
            },
            result = outbound => match result {
                Ok(()) => debug!("{} to {} outbox closed", self.id, self.peer),
                Err(e) => error!("{} to {} failed writing: {}", self.id, self.peer, e),
            },
        }

        self.outbox.lock().take();
        self.emit(LinkEvent::Closed {
            peer: self.peer.clone(),
            link: self.id,
        });
    }

    fn fail(&self) {
        self.emit(LinkEvent::Closed {
            peer: self.peer.clone(),
            link: self.id,
        });
    }
}

/// Handle to one TCP link
struct TcpLink {
    shared: Arc<LinkShared>,
    /// Token the responder must echo (initiator side only)
    expected_token: Option<String>,
    /// Feed of extra dial targets (responder side only)
    candidates: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl DirectLink for TcpLink {
    fn id(&self) -> LinkId {
        self.shared.id
    }

    async fn apply_answer(&self, answer: &Value) -> Result<(), TransportError> {
        let expected = self.expected_token.as_deref().ok_or_else(|| {
            TransportError::InvalidPayload("answer applied to a responder link".to_string())
        })?;

        if answer.get("transport").and_then(Value::as_str) != Some(TRANSPORT_NAME) {
            return Err(TransportError::InvalidPayload(
                "answer is not for a tcp link".to_string(),
            ));
        }
        if answer.get("token").and_then(Value::as_str) != Some(expected) {
            return Err(TransportError::InvalidPayload(
                "answer token does not match the offer".to_string(),
            ));
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: &Value) -> Result<(), TransportError> {
        let addr = candidate
            .get("addr")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::InvalidPayload("candidate without addr".to_string()))?;

        match &self.candidates {
            // A dial task that already connected has dropped its receiver.
            Some(candidates) => {
                let _ = candidates.send(addr.to_string());
            }
            None => debug!("{} ignores candidate {}: initiator listens", self.shared.id, addr),
        }
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.contains(&b'\n') {
            return Err(TransportError::InvalidPayload(
                "frame contains a newline".to_string(),
            ));
        }
        let line = std::str::from_utf8(payload)
            .map_err(|_| TransportError::InvalidPayload("frame is not UTF-8".to_string()))?
            .to_string();

        let outbox = self.shared.outbox.lock().clone().ok_or(TransportError::Closed)?;
        match outbox.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("{} to {} is not draining, dropping the link", self.shared.id, self.shared.peer);
                self.close();
                Err(TransportError::SendFailed("outbound queue full".to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }
        self.shared.outbox.lock().take();
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    token: String,
    handshake_timeout: Duration,
    shared: Arc<LinkShared>,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("{} accept failed: {}", shared.id, e);
                shared.fail();
                return;
            }
        };

        let (read, write) = stream.into_split();
        let mut reader = shared.reader(read);

        match tokio::time::timeout(handshake_timeout, reader.next()).await {
            Ok(Some(Ok(presented))) if presented == token => {
                info!("{} accepted {} from {}", shared.id, shared.peer, remote);
                drop(listener);
                shared.run(write, reader).await;
                return;
            }
            _ => warn!("{} rejected a connection from {}", shared.id, remote),
        }
    }
}

async fn dial_loop(
    offered: String,
    mut candidates: mpsc::UnboundedReceiver<String>,
    token: String,
    connect_timeout: Duration,
    shared: Arc<LinkShared>,
) {
    let mut target = Some(offered);

    while let Some(addr) = target.take() {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => {
                info!("{} connected to {} at {}", shared.id, shared.peer, addr);
                drop(candidates);

                let (read, mut write) = stream.into_split();
                if let Err(e) = write.write_all(format!("{}\n", token).as_bytes()).await {
                    warn!("{} handshake with {} failed: {}", shared.id, addr, e);
                    shared.fail();
                    return;
                }
                shared.run(write, shared.reader(read)).await;
                return;
            }
            Ok(Err(e)) => debug!("{} could not dial {}: {}", shared.id, addr, e),
            Err(_) => debug!("{} timed out dialing {}", shared.id, addr),
        }

        target = match tokio::time::timeout(connect_timeout, candidates.recv()).await {
            Ok(Some(next)) => Some(next),
            _ => None,
        };
    }

    warn!("{} exhausted every address for {}", shared.id, shared.peer);
    shared.fail();
}

fn parse_offer(offer: &Value) -> Result<(String, String), TransportError> {
    if offer.get("transport").and_then(Value::as_str) != Some(TRANSPORT_NAME) {
        return Err(TransportError::InvalidPayload(
            "offer is not for a tcp link".to_string(),
        ));
    }
    let addr = offer
        .get("addr")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::InvalidPayload("offer without addr".to_string()))?;
    let token = offer
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::InvalidPayload("offer without token".to_string()))?;

    Ok((addr.to_string(), token.to_string()))
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
