//! Endpoint — one party's client driver
//!
//! Owns the negotiator and the pipeline for a single local address and runs
//! them off three inputs: frames from the relay link, events from direct
//! links, and commands from the application. Everything the application
//! needs to know comes back as [`EndpointEvent`]s.

use crate::anchor::{self, Anchor, CommitmentRecord, Verification};
use crate::crypto::CryptoError;
use crate::message::{self, Message, MessageFields, SealedMessage};
use crate::relay::{RelayEvent, RelayRequest};
use crate::session::negotiator::SessionUpdate;
use crate::session::{KeyStore, Negotiator, SessionError, SessionState, SessionSummary};
use crate::transport::{DirectConnector, LinkEvent, TransportError};
use crate::ParleyError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the command queue
const COMMAND_BUFFER: usize = 64;

/// Which path a message took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Direct,
    Relay,
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Via::Direct => write!(f, "direct"),
            Via::Relay => write!(f, "relay"),
        }
    }
}

/// Events from the endpoint to the application layer
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    /// The relay accepted our registration
    Registered { address: String },
    /// The relay rejected one of our frames
    RelayError { message: String },
    /// Someone asked to be added as a contact
    ContactRequest { from: Option<String> },
    /// A peer session changed state
    SessionChanged { peer: String, state: SessionState },
    MessageSent { message: Message, via: Via },
    MessageReceived { message: Message, via: Via },
    /// An inbound message could not be opened; the channel stays up
    MessageFailed { peer: String, reason: String },
    /// A command issued from a handle failed
    CommandFailed { peer: String, reason: String },
}

/// Commands that can be sent to the endpoint task
#[derive(Debug)]
pub enum Command {
    Connect {
        peer: String,
        reply: oneshot::Sender<Result<(), ParleyError>>,
    },
    Send {
        peer: String,
        content: String,
        reply: oneshot::Sender<Result<Message, ParleyError>>,
    },
    Close {
        peer: String,
        reply: oneshot::Sender<bool>,
    },
    ContactRequest {
        peer: String,
        reply: oneshot::Sender<Result<(), ParleyError>>,
    },
    Verify {
        hash: String,
        fields: MessageFields,
        reply: oneshot::Sender<Result<Verification, ParleyError>>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },
    Shutdown,
}

/// Handle to communicate with a running endpoint task
#[derive(Clone)]
pub struct EndpointHandle {
    commands: mpsc::Sender<Command>,
}

impl EndpointHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ParleyError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| ParleyError::Transport(TransportError::Closed))?;

        reply_rx
            .await
            .map_err(|_| ParleyError::Transport(TransportError::Closed))
    }

    /// Start negotiating a direct channel with `peer`
    pub async fn connect(&self, peer: &str) -> Result<(), ParleyError> {
        let peer = peer.to_string();
        self.request(|reply| Command::Connect { peer, reply }).await?
    }

    /// Send a text message to `peer`
    pub async fn send(&self, peer: &str, content: &str) -> Result<Message, ParleyError> {
        let peer = peer.to_string();
        let content = content.to_string();
        self.request(|reply| Command::Send {
            peer,
            content,
            reply,
        })
        .await?
    }

    pub async fn close(&self, peer: &str) -> Result<bool, ParleyError> {
        let peer = peer.to_string();
        self.request(|reply| Command::Close { peer, reply }).await
    }

    pub async fn contact_request(&self, peer: &str) -> Result<(), ParleyError> {
        let peer = peer.to_string();
        self.request(|reply| Command::ContactRequest { peer, reply })
            .await?
    }

    pub async fn verify(
        &self,
        hash: &str,
        fields: MessageFields,
    ) -> Result<Verification, ParleyError> {
        let hash = hash.to_string();
        self.request(|reply| Command::Verify {
            hash,
            fields,
            reply,
        })
        .await?
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, ParleyError> {
        self.request(|reply| Command::Sessions { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// One local party
pub struct Endpoint {
    address: String,
    negotiator: Negotiator,
    signals: mpsc::UnboundedSender<RelayRequest>,
    anchor: Arc<dyn Anchor>,
    events: mpsc::UnboundedSender<EndpointEvent>,
}

impl Endpoint {
    /// `signals` is the relay link's request queue. The connector must
    /// report on the link event channel later passed to [`Endpoint::run`].
    pub fn new(
        address: &str,
        connector: Arc<dyn DirectConnector>,
        signals: mpsc::UnboundedSender<RelayRequest>,
        anchor: Arc<dyn Anchor>,
    ) -> (Self, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(address, connector, signals.clone(), KeyStore::new());

        let endpoint = Self {
            address: address.to_string(),
            negotiator,
            signals,
            anchor,
            events,
        };
        (endpoint, events_rx)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn keys(&self) -> &KeyStore {
        self.negotiator.keys()
    }

    /// Start negotiating a direct channel with `peer`
    pub async fn connect(&mut self, peer: &str) -> Result<(), ParleyError> {
        self.negotiator.initiate(peer).await?;
        self.emit(EndpointEvent::SessionChanged {
            peer: peer.to_string(),
            state: SessionState::Negotiating,
        });
        Ok(())
    }

    /// Build, seal and deliver a message.
    ///
    /// Goes over the direct channel when the session is connected and
    /// through the relay otherwise. The commitment is handed to the anchor
    /// in the background; delivery never waits for it.
    pub async fn send(&mut self, peer: &str, content: &str) -> Result<Message, ParleyError> {
        message::check_content(content)?;
        let key = self.negotiator.key_for(peer).ok_or(CryptoError::MissingKey)?;

        let message = Message::new(&self.address, peer, content);
        let sealed = message.seal(&key)?;

        let via = self.deliver(peer, sealed).await?;
        debug!("Sent message {} to {} via {}", message.id, peer, via);

        anchor::spawn_commit(
            Arc::clone(&self.anchor),
            CommitmentRecord::for_message(&message),
        );
        self.emit(EndpointEvent::MessageSent {
            message: message.clone(),
            via,
        });
        Ok(message)
    }

    async fn deliver(&mut self, peer: &str, sealed: SealedMessage) -> Result<Via, ParleyError> {
        let frame = message::encode_sealed(&sealed)?;

        match self.negotiator.send_direct(peer, &frame).await {
            Ok(true) => return Ok(Via::Direct),
            Ok(false) => {}
            Err(e) => {
                error!("Direct send to {} failed, falling back to relay: {}", peer, e);
                self.close(peer);
            }
        }

        let SealedMessage { encrypted, iv, hash } = sealed;
        self.signal(RelayRequest::Message {
            to: Some(peer.to_string()),
            encrypted,
            iv,
            hash,
        })?;
        Ok(Via::Relay)
    }

    /// Tear down the session with `peer`
    pub fn close(&mut self, peer: &str) -> bool {
        let existed = self.negotiator.close(peer);
        if existed {
            self.emit(EndpointEvent::SessionChanged {
                peer: peer.to_string(),
                state: SessionState::Closed,
            });
        }
        existed
    }

    pub fn contact_request(&self, peer: &str) -> Result<(), ParleyError> {
        self.signal(RelayRequest::ContactRequest {
            to: Some(peer.to_string()),
            from: Some(self.address.clone()),
        })
    }

    /// Check `fields` against `hash` and the anchor
    pub async fn verify(
        &self,
        hash: &str,
        fields: &MessageFields,
    ) -> Result<Verification, ParleyError> {
        Ok(anchor::verify(self.anchor.as_ref(), hash, fields).await?)
    }

    /// React to one frame delivered by the relay
    pub async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Registered { address, .. } => {
                info!("Registered with relay as {}", address);
                self.emit(EndpointEvent::Registered { address });
            }
            RelayEvent::Error { message } => {
                warn!("Relay error: {}", message);
                self.emit(EndpointEvent::RelayError { message });
            }
            RelayEvent::ContactRequest { from } => {
                self.emit(EndpointEvent::ContactRequest { from });
            }
            RelayEvent::Offer {
                from: Some(from),
                offer,
                encryption_key,
            } => {
                match self
                    .negotiator
                    .handle_offer(&from, &offer, encryption_key.as_deref())
                    .await
                {
                    Ok(()) => self.emit(EndpointEvent::SessionChanged {
                        peer: from,
                        state: SessionState::Negotiating,
                    }),
                    Err(e @ SessionError::UnexpectedFrame { .. }) => {
                        debug!("Kept our own offer to {}: {}", from, e)
                    }
                    Err(e) => warn!("Could not answer offer from {}: {}", from, e),
                }
            }
            RelayEvent::Answer {
                from: Some(from),
                answer,
            } => {
                if let Err(e) = self.negotiator.handle_answer(&from, &answer).await {
                    warn!("Ignoring answer from {}: {}", from, e);
                }
            }
            RelayEvent::IceCandidate {
                from: Some(from),
                candidate,
            } => self.negotiator.handle_candidate(&from, candidate).await,
            RelayEvent::Message {
                from: Some(from),
                encrypted,
                iv,
                hash,
            } => {
                let sealed = SealedMessage { encrypted, iv, hash };
                self.receive(&from, &sealed, Via::Relay);
            }
            other => warn!("Dropping {} frame from an unregistered sender", other.message_type()),
        }
    }

    /// React to one direct link event
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        match self.negotiator.handle_link_event(event) {
            Some(SessionUpdate::State { peer, state }) => {
                self.emit(EndpointEvent::SessionChanged { peer, state });
            }
            Some(SessionUpdate::Data { peer, payload }) => match message::decode_sealed(&payload) {
                Ok(sealed) => self.receive(&peer, &sealed, Via::Direct),
                Err(e) => self.emit(EndpointEvent::MessageFailed {
                    peer,
                    reason: e.to_string(),
                }),
            },
            None => {}
        }
    }

    fn receive(&self, peer: &str, sealed: &SealedMessage, via: Via) {
        let key = self.negotiator.key_for(peer);

        let event = match sealed.open(key.as_ref()) {
            Ok(message) if message.from != peer || message.to != self.address => {
                warn!("Message {} claims {} -> {}", message.id, message.from, message.to);
                EndpointEvent::MessageFailed {
                    peer: peer.to_string(),
                    reason: "message addressing does not match its sender".to_string(),
                }
            }
            Ok(message) => {
                debug!("Received message {} from {} via {}", message.id, peer, via);
                EndpointEvent::MessageReceived { message, via }
            }
            Err(e) => {
                warn!("Could not open message from {}: {}", peer, e);
                EndpointEvent::MessageFailed {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                }
            }
        };
        self.emit(event);
    }

    /// Run on a background task and return a handle for issuing commands
    pub fn spawn(
        self,
        relay_events: mpsc::Receiver<RelayEvent>,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> (EndpointHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(self.run(relay_events, link_events, command_rx));
        (
            EndpointHandle {
                commands: command_tx,
            },
            task,
        )
    }

    /// Event loop. Ends on `Shutdown`, when every handle is dropped, or
    /// when the relay link goes away.
    pub async fn run(
        mut self,
        mut relay_events: mpsc::Receiver<RelayEvent>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        loop {
            tokio::select! {
                event = relay_events.recv() => match event {
                    Some(event) => self.handle_relay_event(event).await,
                    None => {
                        info!("Relay link ended, stopping endpoint {}", self.address);
                        break;
                    }
                },
                Some(event) = link_events.recv() => self.handle_link_event(event),
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
            }
        }

        self.negotiator.close_all();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { peer, reply } => {
                let result = self.connect(&peer).await;
                self.report(&peer, &result);
                let _ = reply.send(result);
            }
            Command::Send {
                peer,
                content,
                reply,
            } => {
                let result = self.send(&peer, &content).await;
                self.report(&peer, &result);
                let _ = reply.send(result);
            }
            Command::Close { peer, reply } => {
                let _ = reply.send(self.close(&peer));
            }
            Command::ContactRequest { peer, reply } => {
                let _ = reply.send(self.contact_request(&peer));
            }
            Command::Verify {
                hash,
                fields,
                reply,
            } => {
                let _ = reply.send(self.verify(&hash, &fields).await);
            }
            Command::Sessions { reply } => {
                let _ = reply.send(self.negotiator.sessions());
            }
            Command::Shutdown => {}
        }
    }

    fn report<T>(&self, peer: &str, result: &Result<T, ParleyError>) {
        if let Err(e) = result {
            self.emit(EndpointEvent::CommandFailed {
                peer: peer.to_string(),
                reason: e.to_string(),
            });
        }
    }

    fn signal(&self, request: RelayRequest) -> Result<(), ParleyError> {
        self.signals
            .send(request)
            .map_err(|_| ParleyError::Transport(TransportError::Closed))
    }

    fn emit(&self, event: EndpointEvent) {
        // Nobody listening is fine: the application may not care.
        let _ = self.events.send(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================
