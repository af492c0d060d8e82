use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{ConnectionMonitor, PeerStatus};
use crate::error::{Error, Result};
use crate::media::LocalMedia;
use crate::peer::{LinkEvent, LinkFactory};

use super::session::{PeerSession, SessionLimits, SessionWiring};
use super::{ConnectionId, EngineEvent, Outbound};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_structural_recoveries: u32,
    pub recovery_delay: Duration,
    pub answer_timeout: Duration,
    pub max_answer_timeouts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_structural_recoveries: 2,
            recovery_delay: Duration::from_millis(250),
            answer_timeout: Duration::from_secs(10),
            max_answer_timeouts: 2,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_structural_recoveries: config.max_structural_recoveries,
            recovery_delay: config.recovery_delay(),
            answer_timeout: config.answer_timeout(),
            max_answer_timeouts: config.max_answer_timeouts,
        }
    }
}

enum Command {
    Start { initiate: bool },
    RemoteOffer(String),
    RemoteAnswer(String),
    RemoteCandidate(String),
    LocalMediaChanged(LocalMedia),
}

struct PeerHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    monitor: ConnectionMonitor,
    task: Option<JoinHandle<()>>,
}

struct EngineInner {
    factory: Arc<dyn LinkFactory>,
    settings: EngineSettings,
    local_id: Mutex<Option<ConnectionId>>,
    media: Mutex<LocalMedia>,
    sessions: Mutex<HashMap<ConnectionId, PeerHandle>>,
    active: AtomicBool,
    generations: AtomicU64,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

/// Registry of peer sessions keyed by connection id.
///
/// Each session runs on its own task and consumes commands in order, so
/// transitions for one peer are serialized while peers proceed
/// independently. A replacement for a connection id is only inserted once
/// the previous session has fully closed.
#[derive(Clone)]
pub struct NegotiationEngine {
    inner: Arc<EngineInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl NegotiationEngine {
    pub fn new(
        factory: Arc<dyn LinkFactory>,
        settings: EngineSettings,
        outbound: mpsc::UnboundedSender<Outbound>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                factory,
                settings,
                local_id: Mutex::new(None),
                media: Mutex::new(LocalMedia::default()),
                sessions: Mutex::new(HashMap::new()),
                active: AtomicBool::new(false),
                generations: AtomicU64::new(0),
                outbound,
                events,
            }),
        }
    }

    pub fn local_id(&self) -> Option<ConnectionId> {
        lock(&self.inner.local_id).clone()
    }

    pub fn set_local_id(&self, id: ConnectionId) {
        *lock(&self.inner.local_id) = Some(id);
    }

    /// Accept signaling input. Until activated every inbound event is dropped.
    pub fn activate(&self) {
        self.inner.active.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn contains(&self, peer: &ConnectionId) -> bool {
        lock(&self.inner.sessions).contains_key(peer)
    }

    pub fn peers(&self) -> Vec<ConnectionId> {
        let mut peers: Vec<_> = lock(&self.inner.sessions).keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn peer_status(&self, peer: &ConnectionId) -> Option<PeerStatus> {
        lock(&self.inner.sessions)
            .get(peer)
            .map(|handle| handle.monitor.snapshot())
    }

    pub fn subscribe(&self, peer: &ConnectionId) -> Option<watch::Receiver<PeerStatus>> {
        lock(&self.inner.sessions)
            .get(peer)
            .map(|handle| handle.monitor.subscribe())
    }

    /// Creates a session for `peer` unless one already exists.
    pub fn create_session(&self, peer: &ConnectionId, initiate: bool) {
        if !self.is_active() {
            debug!(%peer, "engine inactive, session not created");
            return;
        }
        self.inner.spawn_session(peer, initiate, 0);
    }

    pub fn handle_offer(&self, from: &ConnectionId, sdp: String) {
        if !self.is_active() {
            return;
        }
        // an offer from an unknown peer opens a non-initiating session
        self.inner.spawn_session(from, false, 0);
        self.inner.dispatch(from, Command::RemoteOffer(sdp));
    }

    pub fn handle_answer(&self, from: &ConnectionId, sdp: String) {
        if !self.is_active() {
            return;
        }
        if !self.inner.dispatch(from, Command::RemoteAnswer(sdp)) {
            let err = Error::UnexpectedAnswer {
                peer: from.clone(),
                state: "no session".to_string(),
            };
            warn!("{}", err);
        }
    }

    pub fn handle_candidate(&self, from: &ConnectionId, candidate: String) {
        if !self.is_active() {
            return;
        }
        // queued by the new session until a description arrives
        self.inner.spawn_session(from, false, 0);
        self.inner.dispatch(from, Command::RemoteCandidate(candidate));
    }

    /// Replaces the local track set and renegotiates with every peer.
    pub fn set_local_media(&self, media: LocalMedia) {
        *lock(&self.inner.media) = media.clone();
        let sessions = lock(&self.inner.sessions);
        for handle in sessions.values() {
            let _ = handle
                .commands
                .send(Command::LocalMediaChanged(media.clone()));
        }
    }

    pub async fn close_session(&self, peer: &ConnectionId) {
        let handle = lock(&self.inner.sessions).remove(peer);
        if let Some(handle) = handle {
            EngineInner::shutdown(peer, handle).await;
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = lock(&self.inner.sessions).drain().collect();
        for (peer, handle) in drained {
            EngineInner::shutdown(&peer, handle).await;
        }
    }
}

impl EngineInner {
    fn dispatch(&self, peer: &ConnectionId, command: Command) -> bool {
        match lock(&self.sessions).get(peer) {
            Some(handle) => handle.commands.send(command).is_ok(),
            None => false,
        }
    }

    async fn shutdown(peer: &ConnectionId, mut handle: PeerHandle) {
        handle.cancel.cancel();
        if let Some(task) = handle.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(%peer, "peer session task failed: {}", e);
                }
            }
        }
    }

    fn spawn_session(self: &Arc<Self>, peer: &ConnectionId, initiate: bool, recoveries: u32) {
        let Some(local) = lock(&self.local_id).clone() else {
            warn!(%peer, "no local connection id yet, session not created");
            return;
        };
        if &local == peer {
            return;
        }

        let mut sessions = lock(&self.sessions);
        // checked under the lock: close_all after deactivate must see every entry
        if !self.active.load(Ordering::SeqCst) || sessions.contains_key(peer) {
            return;
        }
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let monitor = ConnectionMonitor::new();
        let _ = commands.send(Command::Start { initiate });

        let task = tokio::spawn(Arc::clone(self).run_session(
            local,
            peer.clone(),
            generation,
            recoveries,
            rx,
            cancel.clone(),
            monitor.clone(),
        ));
        sessions.insert(
            peer.clone(),
            PeerHandle {
                generation,
                commands,
                cancel,
                monitor,
                task: Some(task),
            },
        );
        debug!(%peer, generation, initiate, recoveries, "peer session created");
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_session(
        self: Arc<Self>,
        local: ConnectionId,
        peer: ConnectionId,
        generation: u64,
        recoveries: u32,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
        monitor: ConnectionMonitor,
    ) {
        let (link_tx, mut link_rx) = mpsc::unbounded_channel::<LinkEvent>();
        let link = tokio::select! {
            _ = cancel.cancelled() => return,
            link = self.factory.open(&peer, link_tx) => link,
        };
        let link = match link {
            Ok(link) => link,
            Err(e) => {
                warn!(%peer, "Failed to open peer link: {}", e);
                monitor.set_error(e.to_string());
                self.forget(&peer, generation);
                return;
            }
        };

        let media = lock(&self.media).clone();
        let wiring = SessionWiring {
            outbound: self.outbound.clone(),
            events: self.events.clone(),
            monitor,
            cancel: cancel.clone(),
        };
        let limits = SessionLimits {
            answer_timeout: self.settings.answer_timeout,
            max_answer_timeouts: self.settings.max_answer_timeouts,
        };
        let mut session = PeerSession::new(local, peer.clone(), link, media, wiring, limits);

        loop {
            let deadline = session.answer_deadline();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => Self::apply(&mut session, command).await,
                    None => break,
                },
                Some(event) = link_rx.recv() => session.on_link_event(event).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    session.on_answer_timeout().await
                }
            };

            match outcome {
                Ok(()) => {}
                Err(e) if !e.is_fatal() => warn!(%peer, "{}", e),
                Err(e) => {
                    warn!(%peer, recoveries, "negotiation failed, rebuilding session: {}", e);
                    session.record_error(&e);
                    session.abort_negotiation().await;
                    session.close().await;
                    tokio::spawn(Arc::clone(&self).recover(peer, generation, recoveries + 1));
                    return;
                }
            }
        }
        session.close().await;
    }

    async fn apply(session: &mut PeerSession, command: Command) -> Result<()> {
        match command {
            Command::Start { initiate } => session.start(initiate).await,
            Command::RemoteOffer(sdp) => session.on_remote_offer(sdp).await,
            Command::RemoteAnswer(sdp) => session.on_remote_answer(sdp).await,
            Command::RemoteCandidate(candidate) => session.on_remote_candidate(candidate).await,
            Command::LocalMediaChanged(media) => session.on_local_media_changed(media).await,
        }
    }

    /// Removes the registry entry only if it still belongs to `generation`.
    fn forget(&self, peer: &ConnectionId, generation: u64) -> Option<PeerHandle> {
        let mut sessions = lock(&self.sessions);
        match sessions.get(peer) {
            Some(handle) if handle.generation == generation => sessions.remove(peer),
            _ => None,
        }
    }

    /// Replaces a session torn down after a failed step, or gives up once the
    /// per-peer bound is exceeded.
    async fn recover(self: Arc<Self>, peer: ConnectionId, generation: u64, recoveries: u32) {
        if recoveries > self.settings.max_structural_recoveries {
            if self.forget(&peer, generation).is_some() {
                let err = Error::NegotiationAbandoned(peer.clone());
                warn!("{} after {} recoveries", err, recoveries - 1);
                let _ = self.events.send(EngineEvent::Abandoned { peer });
            }
            return;
        }

        sleep(self.settings.recovery_delay).await;
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        // an explicit close during the delay already removed this generation
        if self.forget(&peer, generation).is_none() {
            return;
        }
        info!(%peer, attempt = recoveries, "recreating peer session");
        self.spawn_session(&peer, true, recoveries);
    }
}
