use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ReconnectConfig};
use crate::connection::ConnectivityState;
use crate::error::{Error, Result};
use crate::negotiation::ConnectionId;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

/// Negotiation payload relayed between two participants. Bodies are opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(String),
    Answer(String),
    Candidate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Peer(ConnectionId),
    Room,
}

/// Client to relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        display_name: String,
    },
    LeaveRoom {
        room_id: String,
    },
    SendOffer {
        target: Target,
        sdp: String,
    },
    SendAnswer {
        target: ConnectionId,
        sdp: String,
    },
    SendIceCandidate {
        target: ConnectionId,
        candidate: String,
    },
}

impl ClientMessage {
    pub fn from_signal(target: Target, signal: Signal) -> Option<Self> {
        match (signal, target) {
            (Signal::Offer(sdp), target) => Some(ClientMessage::SendOffer { target, sdp }),
            (Signal::Answer(sdp), Target::Peer(target)) => {
                Some(ClientMessage::SendAnswer { target, sdp })
            }
            (Signal::Candidate(candidate), Target::Peer(target)) => {
                Some(ClientMessage::SendIceCandidate { target, candidate })
            }
            // answers and candidates only make sense for one participant
            (_, Target::Room) => None,
        }
    }
}

/// Relay to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Welcome {
        connection_id: ConnectionId,
    },
    RoomJoined {
        room_id: String,
    },
    RoomNotFound {
        room_id: String,
    },
    ParticipantJoined {
        connection_id: ConnectionId,
        display_name: String,
    },
    ParticipantLeft {
        connection_id: ConnectionId,
    },
    OfferReceived {
        sdp: String,
        from: ConnectionId,
    },
    AnswerReceived {
        sdp: String,
        from: ConnectionId,
    },
    CandidateReceived {
        candidate: String,
        from: ConnectionId,
    },
}

/// Ordered event stream produced by a signaling channel. A `Connected`
/// carrying a new id marks the start of a fresh transport; every event
/// before it refers to dead connection ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Connected(ConnectionId),
    Reconnecting,
    ParticipantJoined {
        connection_id: ConnectionId,
        display_name: String,
    },
    ParticipantLeft(ConnectionId),
    OfferReceived {
        sdp: String,
        from: ConnectionId,
    },
    AnswerReceived {
        sdp: String,
        from: ConnectionId,
    },
    CandidateReceived {
        candidate: String,
        from: ConnectionId,
    },
    RoomNotFound(String),
    /// The channel gave up reconnecting or was closed locally.
    Closed,
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn connect(&self) -> Result<ConnectionId>;
    async fn join_room(&self, room_id: &str) -> Result<()>;
    /// Best effort; failures are logged.
    async fn leave_room(&self, room_id: &str);
    /// Fire and forget. Dropped with a warning while disconnected.
    fn send(&self, target: Target, signal: Signal);
    fn connection_id(&self) -> Option<ConnectionId>;
    fn connectivity(&self) -> watch::Receiver<ConnectivityState>;
    /// Hands out the event stream. Only the first caller receives it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>>;
    fn close(&self);
}

#[derive(Default)]
struct ClientState {
    connection_id: Option<ConnectionId>,
    room: Option<String>,
    outgoing: Option<mpsc::UnboundedSender<ClientMessage>>,
    pending_join: Option<(String, oneshot::Sender<Result<()>>)>,
    shutdown: CancellationToken,
}

struct Inner {
    url: String,
    display_name: String,
    reconnect: ReconnectConfig,
    join_timeout: Duration,
    state: Mutex<ClientState>,
    connectivity: watch::Sender<ConnectivityState>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
}

/// Websocket client for the relay, reconnecting with jittered backoff.
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<Inner>,
}

enum PumpEnd {
    Lost,
    Shutdown,
}

impl SignalingClient {
    pub fn new(config: &Config) -> Self {
        let (connectivity, _) = watch::channel(ConnectivityState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                url: config.relay_url.clone(),
                display_name: config.display_name.clone(),
                reconnect: config.reconnect.clone(),
                join_timeout: config.join_timeout(),
                state: Mutex::new(ClientState::default()),
                connectivity,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_connectivity(&self, state: ConnectivityState) {
        self.connectivity.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Opens the socket and waits for the relay to assign a connection id.
    async fn open(&self) -> Result<(WsStream, ConnectionId)> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::ChannelUnavailable(format!("{}: {}", self.url, e)))?;

        let id = timeout(WELCOME_TIMEOUT, await_welcome(&mut ws))
            .await
            .map_err(|_| Error::ChannelUnavailable("no welcome from relay".to_string()))??;
        Ok((ws, id))
    }

    fn install(&self, id: &ConnectionId) -> mpsc::UnboundedReceiver<ClientMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.connection_id = Some(id.clone());
        state.outgoing = Some(tx);
        rx
    }

    /// Forgets everything tied to the current transport. The relay drops
    /// room membership with the socket, so the room is forgotten too.
    fn uninstall(&self) {
        let mut state = self.state();
        state.connection_id = None;
        state.outgoing = None;
        state.room = None;
        if let Some((_, pending)) = state.pending_join.take() {
            let _ = pending.send(Err(Error::NotConnected));
        }
    }

    fn handle_relay_message(&self, message: RelayMessage) {
        match message {
            RelayMessage::Welcome { connection_id } => {
                debug!(%connection_id, "duplicate welcome ignored");
            }
            RelayMessage::RoomJoined { room_id } => {
                let mut state = self.state();
                match state.pending_join.take() {
                    Some((pending_room, reply)) if pending_room == room_id => {
                        state.room = Some(room_id);
                        let _ = reply.send(Ok(()));
                    }
                    other => {
                        state.pending_join = other;
                        debug!(room = %room_id, "unsolicited room confirmation");
                    }
                }
            }
            RelayMessage::RoomNotFound { room_id } => {
                {
                    let mut state = self.state();
                    match state.pending_join.take() {
                        Some((pending_room, reply)) if pending_room == room_id => {
                            let _ = reply.send(Err(Error::RoomJoinRejected(room_id.clone())));
                        }
                        other => state.pending_join = other,
                    }
                }
                self.emit(SignalingEvent::RoomNotFound(room_id));
            }
            RelayMessage::ParticipantJoined {
                connection_id,
                display_name,
            } => self.emit(SignalingEvent::ParticipantJoined {
                connection_id,
                display_name,
            }),
            RelayMessage::ParticipantLeft { connection_id } => {
                self.emit(SignalingEvent::ParticipantLeft(connection_id))
            }
            RelayMessage::OfferReceived { sdp, from } => {
                self.emit(SignalingEvent::OfferReceived { sdp, from })
            }
            RelayMessage::AnswerReceived { sdp, from } => {
                self.emit(SignalingEvent::AnswerReceived { sdp, from })
            }
            RelayMessage::CandidateReceived { candidate, from } => {
                self.emit(SignalingEvent::CandidateReceived { candidate, from })
            }
        }
    }

    async fn pump(
        &self,
        ws: WsStream,
        outgoing: &mut mpsc::UnboundedReceiver<ClientMessage>,
        shutdown: &CancellationToken,
    ) -> PumpEnd {
        let (mut write, mut read) = ws.split();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return PumpEnd::Shutdown;
                }
                msg = outgoing.recv() => {
                    let Some(msg) = msg else { return PumpEnd::Lost };
                    match serde_json::to_string(&msg) {
                        Ok(json) => {
                            if let Err(e) = write.send(Message::Text(json)).await {
                                warn!("Relay write failed: {}", e);
                                return PumpEnd::Lost;
                            }
                        }
                        Err(e) => warn!("Failed to encode {:?}: {}", msg, e),
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(message) => self.handle_relay_message(message),
                        Err(e) => warn!("Malformed relay message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => return PumpEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Relay read failed: {}", e);
                        return PumpEnd::Lost;
                    }
                },
            }
        }
    }

    /// Runs one transport after another until shutdown or until reconnect
    /// attempts are exhausted.
    async fn drive(
        self: Arc<Self>,
        mut ws: WsStream,
        mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            match self.pump(ws, &mut outgoing, &shutdown).await {
                PumpEnd::Shutdown => {
                    self.uninstall();
                    self.set_connectivity(ConnectivityState::Disconnected);
                    self.emit(SignalingEvent::Closed);
                    return;
                }
                PumpEnd::Lost => {
                    warn!("Relay connection lost, reconnecting");
                    self.uninstall();
                    self.set_connectivity(ConnectivityState::Reconnecting);
                    self.emit(SignalingEvent::Reconnecting);
                }
            }

            match self.reconnect(&shutdown).await {
                Some((next_ws, id)) => {
                    outgoing = self.install(&id);
                    ws = next_ws;
                    info!(connection_id = %id, "Reconnected to relay");
                    self.set_connectivity(ConnectivityState::Connected);
                    self.emit(SignalingEvent::Connected(id));
                }
                None => {
                    if shutdown.is_cancelled() {
                        self.set_connectivity(ConnectivityState::Disconnected);
                    } else {
                        warn!("Giving up on relay after {} attempts", self.reconnect.max_attempts);
                        self.set_connectivity(ConnectivityState::Failed);
                    }
                    self.emit(SignalingEvent::Closed);
                    return;
                }
            }
        }
    }

    async fn reconnect(&self, shutdown: &CancellationToken) -> Option<(WsStream, ConnectionId)> {
        let mut backoff = self.reconnect.initial_backoff();
        for attempt in 1..=self.reconnect.max_attempts {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = sleep_with_jitter(backoff) => {}
            }
            match self.open().await {
                Ok(opened) => return Some(opened),
                Err(e) => debug!(attempt, "Reconnection failed: {}", e),
            }
            backoff = next_backoff(backoff, self.reconnect.max_backoff());
        }
        None
    }
}

async fn await_welcome(ws: &mut WsStream) -> Result<ConnectionId> {
    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| Error::ChannelUnavailable(e.to_string()))?;
        if let Message::Text(text) = frame {
            match serde_json::from_str::<RelayMessage>(&text) {
                Ok(RelayMessage::Welcome { connection_id }) => return Ok(connection_id),
                Ok(other) => debug!(?other, "message before welcome ignored"),
                Err(e) => warn!("Malformed relay message: {}", e),
            }
        }
    }
    Err(Error::ChannelUnavailable(
        "relay closed before welcome".to_string(),
    ))
}

pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    sleep(base + Duration::from_millis(jitter_ms)).await;
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    async fn connect(&self) -> Result<ConnectionId> {
        if let Some(id) = self.connection_id() {
            return Ok(id);
        }
        let inner = &self.inner;
        inner.set_connectivity(ConnectivityState::Connecting);

        let (ws, id) = match inner.open().await {
            Ok(opened) => opened,
            Err(e) => {
                inner.set_connectivity(ConnectivityState::Disconnected);
                return Err(e);
            }
        };

        let outgoing = inner.install(&id);
        let shutdown = {
            let mut state = inner.state();
            if state.shutdown.is_cancelled() {
                state.shutdown = CancellationToken::new();
            }
            state.shutdown.clone()
        };
        info!(connection_id = %id, url = %inner.url, "Connected to relay");
        inner.set_connectivity(ConnectivityState::Connected);
        inner.emit(SignalingEvent::Connected(id.clone()));

        tokio::spawn(Arc::clone(inner).drive(ws, outgoing, shutdown));
        Ok(id)
    }

    async fn join_room(&self, room_id: &str) -> Result<()> {
        let reply = {
            let mut state = self.inner.state();
            let outgoing = state.outgoing.clone().ok_or(Error::NotConnected)?;
            if state.room.as_deref() == Some(room_id) {
                return Ok(());
            }
            if let Some(previous) = state.room.take() {
                let _ = outgoing.send(ClientMessage::LeaveRoom { room_id: previous });
            }
            let (tx, rx) = oneshot::channel();
            if let Some((_, superseded)) = state.pending_join.replace((room_id.to_string(), tx)) {
                let _ = superseded.send(Err(Error::NotConnected));
            }
            outgoing
                .send(ClientMessage::JoinRoom {
                    room_id: room_id.to_string(),
                    display_name: self.inner.display_name.clone(),
                })
                .map_err(|_| Error::NotConnected)?;
            rx
        };

        match timeout(self.inner.join_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.inner.state().pending_join = None;
                Err(Error::ChannelUnavailable(format!(
                    "no answer to join of room {}",
                    room_id
                )))
            }
        }
    }

    async fn leave_room(&self, room_id: &str) {
        let mut state = self.inner.state();
        if state.room.as_deref() == Some(room_id) {
            state.room = None;
        }
        match &state.outgoing {
            Some(outgoing) => {
                if outgoing
                    .send(ClientMessage::LeaveRoom {
                        room_id: room_id.to_string(),
                    })
                    .is_err()
                {
                    warn!(room = %room_id, "leave not delivered, relay writer gone");
                }
            }
            None => warn!(room = %room_id, "leave skipped, not connected"),
        }
    }

    fn send(&self, target: Target, signal: Signal) {
        let Some(message) = ClientMessage::from_signal(target, signal) else {
            warn!("Dropping signal that needs a single participant target");
            return;
        };
        let state = self.inner.state();
        match &state.outgoing {
            Some(outgoing) => {
                if outgoing.send(message).is_err() {
                    warn!("Dropping signal, relay writer gone");
                }
            }
            None => warn!("Dropping signal while not connected"),
        }
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.state().connection_id.clone()
    }

    fn connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.connectivity.subscribe()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn close(&self) {
        self.inner.state().shutdown.cancel();
    }
}
