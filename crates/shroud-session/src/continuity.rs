//! Session Continuity Manager
//!
//! Owns the socket pool and every live session. Inbound datagrams are
//! demultiplexed by trial-opening them with each session's channel, so a
//! datagram is accepted whichever of a session's pairs it arrived on.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use shroud_crypto::{PskChannel, Role, SecureDatagram, SessionKeys};
use shroud_protocol::{
    HandshakeOutcome, HopCoordinator, HopParameters, HopSchedule, SessionId, SessionStatus,
};
use shroud_timing::{DummyGenerator, DummyRate, TransmissionScheduler};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::actor::{ActorSettings, ActorWiring, Command, SessionActor};
use crate::config::SessionConfig;
use crate::errors::{SessionError, SessionResult};
use crate::events::{CloseReason, EventSink, ObfuscationEvent};
use crate::pool::{RawDatagram, SocketPool};
use crate::snapshot::SessionSnapshot;
use crate::transport::DatagramTransport;

const COMMAND_QUEUE: usize = 256;
const INBOUND_QUEUE: usize = 1024;

/// Trial-open order key, session, channel and command sender
type Candidate = (bool, SessionId, Arc<dyn SecureDatagram>, mpsc::Sender<Command>);
const RETIRED_LIMIT: usize = 1024;

/// Everything needed to bring a session up after a handshake
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Identifier agreed at handshake
    pub id: SessionId,
    /// Keying material
    pub keys: SessionKeys,
    /// Which end this is
    pub role: Role,
    /// Peer address; ports come from the hop schedule
    pub peer: IpAddr,
    /// Hop parameters agreed at handshake
    pub hop: HopParameters,
    /// Instant the handshake completed locally
    pub epoch: Instant,
}

impl SessionParams {
    /// Build parameters from a completed handshake
    pub fn from_handshake(
        outcome: HandshakeOutcome,
        role: Role,
        peer: IpAddr,
        epoch: Instant,
    ) -> Self {
        Self {
            id: outcome.session_id,
            keys: outcome.keys,
            role,
            peer,
            hop: outcome.params,
            epoch,
        }
    }
}

/// Application side of one session
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    delivered: mpsc::UnboundedReceiver<Vec<u8>>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Get the session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Next delivered payload, in send order; `None` once the session is gone
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.delivered.recv().await
    }

    /// Next delivered payload if one is ready
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.delivered.try_recv().ok()
    }

    /// Get current status
    pub fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status
    }

    /// Get the latest snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }
}

pub(crate) struct SessionEntry {
    commands: mpsc::Sender<Command>,
    channel: Arc<dyn SecureDatagram>,
    snapshot: watch::Receiver<SessionSnapshot>,
    dummy: DummyGenerator,
    task: JoinHandle<()>,
}

/// Live sessions plus the final status of recently closed ones
#[derive(Default)]
pub(crate) struct Registry {
    live: HashMap<SessionId, SessionEntry>,
    retired: HashMap<SessionId, SessionStatus>,
    retired_order: VecDeque<SessionId>,
}

impl Registry {
    pub(crate) fn retire(&mut self, id: SessionId, status: SessionStatus) {
        self.live.remove(&id);
        if self.retired.insert(id, status).is_none() {
            self.retired_order.push_back(id);
        }
        while self.retired_order.len() > RETIRED_LIMIT {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }
}

struct ManagerInner {
    config: SessionConfig,
    pool: Arc<SocketPool>,
    registry: Arc<RwLock<Registry>>,
    events: EventSink,
    shared_dummy: Option<DummyGenerator>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Runs every session of one endpoint
#[derive(Clone)]
pub struct ContinuityManager {
    inner: Arc<ManagerInner>,
}

impl ContinuityManager {
    /// Create a manager without an event collector
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn DatagramTransport>,
    ) -> SessionResult<Self> {
        Self::with_events(config, transport, EventSink::disabled())
    }

    /// Create a manager reporting to `events`
    pub fn with_events(
        config: SessionConfig,
        transport: Arc<dyn DatagramTransport>,
        events: EventSink,
    ) -> SessionResult<Self> {
        config.validate()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let shared_dummy = config
            .shared_dummy_generator
            .then(|| DummyGenerator::new(config.dummy_rate()));
        let inner = Arc::new(ManagerInner {
            config,
            pool: Arc::new(SocketPool::new(transport, inbound_tx)),
            registry: Arc::new(RwLock::new(Registry::default())),
            events,
            shared_dummy,
            background: Mutex::new(Vec::new()),
        });

        let mut background = vec![tokio::spawn(demux_loop(Arc::downgrade(&inner), inbound_rx))];
        if let Some(dummy) = &inner.shared_dummy {
            background.push(tokio::spawn(shared_cover_loop(
                Arc::downgrade(&inner),
                dummy.subscribe(),
            )));
        }
        *inner.background.lock().unwrap_or_else(PoisonError::into_inner) = background;

        info!(transport = inner.pool.transport_name(), "Continuity manager started");
        Ok(Self { inner })
    }

    /// Get the configuration
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Bring up a session. Its hop 0 sockets are bound on return.
    pub async fn open_session(&self, params: SessionParams) -> SessionResult<SessionHandle> {
        let config = &self.inner.config;
        let id = params.id;

        let schedule = HopSchedule::new(&params.keys.hop_seed, params.hop)?;
        let channel: Arc<dyn SecureDatagram> = Arc::new(PskChannel::new(&params.keys, params.role));
        let normalizer = config.normalizer(channel.overhead())?;
        let scheduler =
            TransmissionScheduler::new(config.jitter_policy(), config.queue_bound, Instant::now())?;
        let coordinator =
            HopCoordinator::new(params.role, schedule, config.hop_timing(), params.epoch);

        let mut registry = self.inner.registry.write().await;
        if registry.live.contains_key(&id) {
            return Err(SessionError::SessionExists(id.to_hex()));
        }
        registry.retired.remove(&id);

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::new(id));
        let dummy = match &self.inner.shared_dummy {
            Some(shared) => shared.clone(),
            None => DummyGenerator::new(config.dummy_rate()),
        };

        let mut actor = SessionActor::new(
            id,
            params.role,
            params.peer,
            channel.clone(),
            normalizer,
            scheduler,
            coordinator,
            ActorSettings {
                padding_probability: config.padding_probability,
                idle_timeout: config.idle_timeout(),
                ack_delay: config.ack_delay(),
                auth_failure_threshold: config.auth_failure_threshold,
                retransmit_timeout: config.retransmit_timeout(),
                queue_bound: config.queue_bound,
            },
            ActorWiring {
                pool: self.inner.pool.clone(),
                registry: self.inner.registry.clone(),
                commands: commands_rx,
                self_tx: commands_tx.downgrade(),
                delivered: delivered_tx,
                snapshot: snapshot_tx,
                events: self.inner.events.clone(),
                dummy: dummy.clone(),
                own_ticker: self.inner.shared_dummy.is_none(),
            },
        );
        actor.start().await;
        let task = tokio::spawn(actor.run());

        registry.live.insert(
            id,
            SessionEntry {
                commands: commands_tx,
                channel,
                snapshot: snapshot_rx.clone(),
                dummy,
                task,
            },
        );
        info!(
            session = %id,
            role = ?params.role,
            peer = %params.peer,
            ports = ?snapshot_rx.borrow().bound_ports,
            "Session opened"
        );

        Ok(SessionHandle {
            id,
            delivered: delivered_rx,
            snapshot: snapshot_rx,
        })
    }

    /// Queue a payload for transmission
    pub async fn send(&self, id: SessionId, payload: impl Into<Vec<u8>>) -> SessionResult<()> {
        let commands = self.commands_for(id).await?;
        let (reply, result) = oneshot::channel();
        commands
            .send(Command::Send {
                payload: payload.into(),
                reply,
            })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        result.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Route one raw datagram to the session that can open it
    pub async fn on_datagram(&self, raw: RawDatagram) {
        self.inner.on_datagram(raw).await;
    }

    /// Close a session, sending the peer a best-effort close
    pub async fn close(&self, id: SessionId) -> SessionResult<()> {
        self.close_with(id, CloseReason::Local).await
    }

    async fn close_with(&self, id: SessionId, reason: CloseReason) -> SessionResult<()> {
        let commands = self.commands_for(id).await?;
        let (reply, done) = oneshot::channel();
        commands
            .send(Command::Close { reason, reply })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        let _ = done.await;
        Ok(())
    }

    /// Get a session's status, including recently closed ones
    pub async fn status(&self, id: SessionId) -> SessionResult<SessionStatus> {
        let registry = self.inner.registry.read().await;
        if let Some(entry) = registry.live.get(&id) {
            return Ok(entry.snapshot.borrow().status);
        }
        registry
            .retired
            .get(&id)
            .copied()
            .ok_or_else(|| SessionError::SessionNotFound(id.to_hex()))
    }

    /// Get a live session's snapshot
    pub async fn snapshot(&self, id: SessionId) -> SessionResult<SessionSnapshot> {
        let registry = self.inner.registry.read().await;
        match registry.live.get(&id) {
            Some(entry) => Ok(entry.snapshot.borrow().clone()),
            None if registry.retired.contains_key(&id) => Err(SessionError::SessionClosed),
            None => Err(SessionError::SessionNotFound(id.to_hex())),
        }
    }

    /// Get a session's cover traffic rate
    pub async fn dummy_rate(&self, id: SessionId) -> SessionResult<DummyRate> {
        let registry = self.inner.registry.read().await;
        match registry.live.get(&id) {
            Some(entry) => Ok(entry.dummy.rate()),
            None if registry.retired.contains_key(&id) => Err(SessionError::SessionClosed),
            None => Err(SessionError::SessionNotFound(id.to_hex())),
        }
    }

    /// Change a session's cover traffic rate at runtime.
    ///
    /// With a shared generator this changes the rate of every session.
    pub async fn set_dummy_rate(&self, id: SessionId, rate: DummyRate) -> SessionResult<()> {
        let registry = self.inner.registry.read().await;
        match registry.live.get(&id) {
            Some(entry) => {
                entry.dummy.set_rate(rate)?;
                debug!(session = %id, interval = ?rate.interval, "Dummy rate changed");
                Ok(())
            }
            None if registry.retired.contains_key(&id) => Err(SessionError::SessionClosed),
            None => Err(SessionError::SessionNotFound(id.to_hex())),
        }
    }

    /// Ids of every live session
    pub async fn sessions(&self) -> Vec<SessionId> {
        self.inner.registry.read().await.live.keys().copied().collect()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.inner.registry.read().await.live.len()
    }

    /// Ports currently bound by any session
    pub async fn bound_ports(&self) -> Vec<u16> {
        self.inner.pool.bound_ports().await
    }

    /// Close every session and stop the demultiplexer and shared cover ticker
    pub async fn shutdown(&self) {
        let ids = self.sessions().await;
        info!(sessions = ids.len(), "Shutting down continuity manager");
        for id in ids {
            if let Err(e) = self.close_with(id, CloseReason::Shutdown).await {
                trace!(session = %id, error = %e, "Session already gone at shutdown");
            }
        }
        self.inner.pool.shutdown().await;
        let background = std::mem::take(
            &mut *self.inner.background.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in background {
            task.abort();
        }
    }

    async fn commands_for(&self, id: SessionId) -> SessionResult<mpsc::Sender<Command>> {
        let registry = self.inner.registry.read().await;
        match registry.live.get(&id) {
            Some(entry) => Ok(entry.commands.clone()),
            None if registry.retired.contains_key(&id) => Err(SessionError::SessionClosed),
            None => Err(SessionError::SessionNotFound(id.to_hex())),
        }
    }
}

impl std::fmt::Debug for ContinuityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuityManager")
            .field("transport", &self.inner.pool.transport_name())
            .finish_non_exhaustive()
    }
}

impl ManagerInner {
    async fn on_datagram(&self, raw: RawDatagram) {
        let mut candidates: Vec<Candidate> = {
            let registry = self.registry.read().await;
            registry
                .live
                .iter()
                .map(|(id, entry)| {
                    (
                        entry.snapshot.borrow().owns_port(raw.local_port),
                        *id,
                        entry.channel.clone(),
                        entry.commands.clone(),
                    )
                })
                .collect()
        };
        // Owners of the arrival port first; any session may still claim it
        candidates.sort_by_key(|(owner, ..)| !*owner);

        for (_, id, channel, commands) in &candidates {
            if let Ok(padded) = channel.open(&raw.bytes) {
                trace!(
                    session = %id,
                    port = raw.local_port,
                    len = raw.bytes.len(),
                    "Datagram claimed"
                );
                let inbound = Command::Inbound {
                    padded,
                    local_port: raw.local_port,
                };
                if commands.send(inbound).await.is_err() {
                    trace!(session = %id, "Session closed before inbound datagram");
                }
                return;
            }
        }

        let mut owned = false;
        for (_, id, _, commands) in candidates.iter().filter(|(owner, ..)| *owner) {
            owned = true;
            let failure = Command::AuthFailure {
                local_port: raw.local_port,
            };
            if commands.try_send(failure).is_err() {
                trace!(session = %id, "Dropped authentication failure notice");
            }
        }
        if !owned {
            debug!(port = raw.local_port, from = %raw.from, "Unclaimed datagram dropped");
            self.events.emit(ObfuscationEvent::AuthFailure {
                session: None,
                local_port: raw.local_port,
                consecutive: 0,
            });
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for task in self
            .background
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        if let Ok(mut registry) = self.registry.try_write() {
            for (_, entry) in registry.live.drain() {
                entry.task.abort();
            }
        }
    }
}

async fn demux_loop(inner: Weak<ManagerInner>, mut inbound: mpsc::Receiver<RawDatagram>) {
    while let Some(raw) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_datagram(raw).await;
    }
    trace!("Demultiplexer stopped");
}

/// One cover ticker for every session of the manager
async fn shared_cover_loop(inner: Weak<ManagerInner>, rate: watch::Receiver<DummyRate>) {
    DummyGenerator::run(rate, move || {
        let inner = inner.clone();
        async move {
            let Some(inner) = inner.upgrade() else {
                return false;
            };
            let registry = inner.registry.read().await;
            for entry in registry.live.values() {
                // A busy session skips this dummy
                let _ = entry.commands.try_send(Command::Dummy);
            }
            true
        }
    })
    .await;
    trace!("Shared cover ticker stopped");
}
