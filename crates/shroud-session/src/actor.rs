//! Session actor
//!
//! One task per session owns every piece of mutable session state: the
//! transmission queue, the hop coordinator, the reliability windows and
//! the handoff buffer. Everything else talks to it through [`Command`]s
//! and reads [`SessionSnapshot`]s. Waiting on jitter, slots or hop timers
//! is a plain `sleep_until`; no lock is held across it.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use shroud_crypto::{Role, SecureDatagram};
use shroud_protocol::{
    Frame, FrameKind, HopAction, HopCoordinator, OutboundFrame, PaddingNormalizer, PortPair,
    SessionId, SessionStatus, FRAME_HEADER_LEN,
};
use shroud_timing::{
    dummy_shape, BucketHistogram, DummyGenerator, Release, TimingError, TransmissionScheduler,
};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::continuity::Registry;
use crate::errors::{SessionError, SessionResult};
use crate::events::{CloseReason, EventSink, ObfuscationEvent};
use crate::pool::SocketPool;
use crate::reliability::{ReceiveWindow, SendWindow};
use crate::snapshot::{SessionCounters, SessionSnapshot};

/// Messages into a session actor
pub(crate) enum Command {
    /// Queue an application payload
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    /// An authenticated datagram, already opened by the secure channel
    Inbound { padded: Vec<u8>, local_port: u16 },
    /// A datagram on one of this session's ports failed authentication
    AuthFailure { local_port: u16 },
    /// The cover ticker fired
    Dummy,
    /// Tear down
    Close {
        reason: CloseReason,
        reply: oneshot::Sender<()>,
    },
}

/// Session-level knobs the actor reads
pub(crate) struct ActorSettings {
    pub padding_probability: f64,
    pub idle_timeout: Duration,
    pub ack_delay: Duration,
    pub auth_failure_threshold: u32,
    pub retransmit_timeout: Duration,
    pub queue_bound: usize,
}

/// Channels and shared resources wired into an actor
pub(crate) struct ActorWiring {
    pub pool: Arc<SocketPool>,
    pub registry: Arc<RwLock<Registry>>,
    pub commands: mpsc::Receiver<Command>,
    pub self_tx: mpsc::WeakSender<Command>,
    pub delivered: mpsc::UnboundedSender<Vec<u8>>,
    pub snapshot: watch::Sender<SessionSnapshot>,
    pub events: EventSink,
    pub dummy: DummyGenerator,
    /// Run a cover ticker for this session alone
    pub own_ticker: bool,
}

pub(crate) struct SessionActor {
    id: SessionId,
    role: Role,
    peer: IpAddr,
    channel: Arc<dyn SecureDatagram>,
    normalizer: PaddingNormalizer,
    scheduler: TransmissionScheduler,
    coordinator: HopCoordinator,
    send_window: SendWindow,
    recv_window: ReceiveWindow,
    settings: ActorSettings,
    wiring: ActorWiring,
    handoff: Vec<OutboundFrame>,
    held_ports: BTreeMap<u16, usize>,
    histogram: BucketHistogram,
    counters: SessionCounters,
    status: SessionStatus,
    ack_due: Option<Instant>,
    last_activity: Instant,
    last_inbound: Option<PortPair>,
    auth_failures: u32,
    close_reply: Option<oneshot::Sender<()>>,
    rng: StdRng,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        role: Role,
        peer: IpAddr,
        channel: Arc<dyn SecureDatagram>,
        normalizer: PaddingNormalizer,
        scheduler: TransmissionScheduler,
        coordinator: HopCoordinator,
        settings: ActorSettings,
        wiring: ActorWiring,
    ) -> Self {
        let send_window = SendWindow::new(settings.retransmit_timeout);
        Self {
            id,
            role,
            peer,
            channel,
            normalizer,
            scheduler,
            coordinator,
            send_window,
            recv_window: ReceiveWindow::new(),
            settings,
            wiring,
            handoff: Vec::new(),
            held_ports: BTreeMap::new(),
            histogram: BucketHistogram::new(),
            counters: SessionCounters::default(),
            status: SessionStatus::Active,
            ack_due: None,
            last_activity: Instant::now(),
            last_inbound: None,
            auth_failures: 0,
            close_reply: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Bind the hop 0 pair
    pub(crate) async fn start(&mut self) {
        let now = Instant::now();
        let actions = self.coordinator.start();
        self.apply_all(actions, now).await;
        self.publish();
    }

    /// Run until closed
    pub(crate) async fn run(mut self) {
        let ticker = self.wiring.own_ticker.then(|| {
            let weak = self.wiring.self_tx.clone();
            tokio::spawn(DummyGenerator::run(self.wiring.dummy.subscribe(), move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(tx) => tx.send(Command::Dummy).await.is_ok(),
                        None => false,
                    }
                }
            }))
        });

        let reason = loop {
            let deadline = self.next_deadline();
            let step = tokio::select! {
                command = self.wiring.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => Some(CloseReason::Shutdown),
                },
                _ = tokio::time::sleep_until(deadline) => self.on_timer(Instant::now()).await,
            };
            if let Some(reason) = step {
                break reason;
            }
            self.publish();
        };

        if let Some(ticker) = ticker {
            ticker.abort();
        }
        self.teardown(reason).await;
    }

    fn next_deadline(&self) -> Instant {
        let idle = self.last_activity + self.settings.idle_timeout;
        [
            self.scheduler.next_wakeup(),
            self.coordinator.next_deadline(),
            self.send_window.next_deadline(),
            self.ack_due,
        ]
        .into_iter()
        .flatten()
        .fold(idle, Instant::min)
    }

    async fn handle(&mut self, command: Command) -> Option<CloseReason> {
        let now = Instant::now();
        match command {
            Command::Send { payload, reply } => {
                let result = self.enqueue_data(payload, now);
                let _ = reply.send(result);
                None
            }
            Command::Inbound { padded, local_port } => {
                self.on_inbound(padded, local_port, now).await
            }
            Command::AuthFailure { local_port } => self.on_auth_failure(local_port),
            Command::Dummy => {
                if self.wiring.dummy.rate().is_enabled() {
                    let frame = self.dummy_frame(now);
                    if let Err(e) = self.scheduler.enqueue(frame, now) {
                        trace!(session = %self.id, error = %e, "Cover frame not queued");
                    }
                }
                None
            }
            Command::Close { reason, reply } => {
                self.close_reply = Some(reply);
                Some(reason)
            }
        }
    }

    async fn on_timer(&mut self, now: Instant) -> Option<CloseReason> {
        if now >= self.last_activity + self.settings.idle_timeout {
            return Some(CloseReason::Idle);
        }

        let actions = self.coordinator.poll(now);
        self.apply_all(actions, now).await;

        for retransmit in self.send_window.due(now) {
            trace!(
                session = %self.id,
                seq = retransmit.seq,
                attempt = retransmit.attempt,
                "Retransmitting"
            );
            self.counters.retransmits += 1;
            let frame = OutboundFrame::new(
                FrameKind::Data,
                retransmit.seq,
                retransmit.payload,
                retransmit.bucket,
                now,
            );
            self.scheduler.requeue(frame, now);
        }

        if self.ack_due.map_or(false, |at| at <= now) {
            self.ack_due = None;
            let ack = self.control_frame(FrameKind::Ack, now);
            self.enqueue_control(ack, now);
        }

        self.scheduler.set_cover(self.wiring.dummy.rate().is_enabled());
        while let Some(release) = self.scheduler.poll_release(now) {
            self.transmit(release, now).await;
        }
        None
    }

    fn enqueue_data(&mut self, payload: Vec<u8>, now: Instant) -> SessionResult<()> {
        if !self.status.is_usable() {
            return Err(SessionError::SessionClosed);
        }

        let bucket = self
            .normalizer
            .bucket_for(Frame::encoded_len(payload.len()))
            .map_err(|_| SessionError::Oversize {
                len: payload.len(),
                max: self.normalizer.max_payload().saturating_sub(FRAME_HEADER_LEN),
            })?;
        let bucket = self
            .normalizer
            .promote(bucket, self.settings.padding_probability, &mut self.rng);

        // Unacknowledged data counts against the same bound as queued data
        let in_flight = self.send_window.in_flight();
        if in_flight >= self.settings.queue_bound {
            return Err(self.backpressure(in_flight, self.settings.queue_bound));
        }

        let seq = self.send_window.peek_seq();
        let frame = OutboundFrame::new(FrameKind::Data, seq, payload.clone(), bucket, now);
        match self.scheduler.enqueue(frame, now) {
            Ok(_) => {
                self.send_window.track(payload, bucket);
                self.last_activity = now;
                self.wiring.events.emit(ObfuscationEvent::QueueDepth {
                    session: self.id,
                    depth: self.scheduler.depth(),
                    real: self.scheduler.real_depth(),
                });
                Ok(())
            }
            Err(TimingError::Backpressure { depth, bound }) => Err(self.backpressure(depth, bound)),
            Err(e) => Err(e.into()),
        }
    }

    fn backpressure(&self, depth: usize, bound: usize) -> SessionError {
        debug!(session = %self.id, depth, bound, "Backpressure on send");
        self.wiring.events.emit(ObfuscationEvent::Backpressure {
            session: self.id,
            depth,
            bound,
        });
        SessionError::Backpressure { depth, bound }
    }

    async fn on_inbound(
        &mut self,
        padded: Vec<u8>,
        local_port: u16,
        now: Instant,
    ) -> Option<CloseReason> {
        let frame = match self
            .normalizer
            .denormalize(&padded)
            .and_then(|inner| Frame::decode(&inner))
        {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.malformed += 1;
                debug!(session = %self.id, error = %e, "Dropping malformed frame");
                return None;
            }
        };

        self.auth_failures = 0;
        if let Some(pair) = self.coordinator.pair_for_local_port(local_port) {
            self.last_inbound = Some(pair);
        }
        let actions = self.coordinator.on_authenticated(local_port, now);
        self.apply_all(actions, now).await;
        self.send_window.on_ack(frame.ack);

        match frame.kind {
            FrameKind::Data => {
                self.counters.data_received += 1;
                let accepted = self.recv_window.on_data(frame.seq, frame.body);
                if accepted.duplicate {
                    self.counters.duplicates += 1;
                }
                for payload in accepted.deliver {
                    self.counters.delivered += 1;
                    let _ = self.wiring.delivered.send(payload);
                }
                if self.ack_due.is_none() {
                    self.ack_due = Some(now + self.settings.ack_delay);
                }
                self.last_activity = now;
            }
            FrameKind::Dummy => {
                self.counters.dummies_received += 1;
                self.last_activity = now;
            }
            FrameKind::Ack => {}
            FrameKind::Probe => {
                let ack = self.control_frame(FrameKind::Ack, now);
                self.enqueue_control(ack, now);
            }
            FrameKind::Close => {
                info!(session = %self.id, "Peer closed session");
                return Some(CloseReason::Remote);
            }
        }
        None
    }

    fn on_auth_failure(&mut self, local_port: u16) -> Option<CloseReason> {
        self.auth_failures += 1;
        self.counters.auth_failures += 1;
        self.wiring.events.emit(ObfuscationEvent::AuthFailure {
            session: Some(self.id),
            local_port,
            consecutive: self.auth_failures,
        });

        if self.auth_failures < self.settings.auth_failure_threshold {
            return None;
        }

        warn!(
            session = %self.id,
            failures = self.auth_failures,
            "Authentication failures past threshold, failing session"
        );
        self.status = SessionStatus::Failed;
        self.wiring.events.emit(ObfuscationEvent::SessionFailed {
            session: self.id,
            reason: format!("{} consecutive authentication failures", self.auth_failures),
        });
        Some(CloseReason::Failed)
    }

    async fn apply_all(&mut self, actions: Vec<HopAction>, now: Instant) {
        for action in actions {
            self.apply(action, now).await;
        }
    }

    async fn apply(&mut self, action: HopAction, now: Instant) {
        match action {
            HopAction::Bind(pair) => self.hold(pair.local(self.role)).await,
            HopAction::Release(pair) => self.unhold(pair.local(self.role)).await,
            HopAction::Probe(pair) => {
                // A hop port whose bind failed is bound again on every retry
                let port = pair.local(self.role);
                if !self.held_ports.contains_key(&port) {
                    self.hold(port).await;
                }
                // Routed at release time, so a re-derived target is honoured
                let probe = self.control_frame(FrameKind::Probe, now);
                self.enqueue_control(probe, now);
            }
            HopAction::Started { hop, old, new } => {
                info!(session = %self.id, hop, old = %old, new = %new, "Hop started");
                self.wiring.events.emit(ObfuscationEvent::HopStarted {
                    session: self.id,
                    hop,
                    old,
                    new,
                });
            }
            HopAction::Retry { hop, attempt } => {
                self.wiring.events.emit(ObfuscationEvent::HopRetry {
                    session: self.id,
                    hop,
                    attempt,
                });
            }
            HopAction::Confirmed {
                hop,
                pair,
                recovered,
            } => {
                self.wiring.events.emit(ObfuscationEvent::HopSucceeded {
                    session: self.id,
                    hop,
                    pair,
                });
                if recovered && self.status == SessionStatus::Degraded {
                    info!(session = %self.id, hop, "Session recovered");
                    self.status = SessionStatus::Active;
                    self.wiring.events.emit(ObfuscationEvent::SessionRecovered {
                        session: self.id,
                        hop,
                    });
                }
                self.flush_handoff(now);
            }
            HopAction::Degraded { hop, retries } => {
                let timeout = SessionError::HopTimeout { hop, retries };
                warn!(session = %self.id, error = %timeout, "Session degraded");
                if self.status == SessionStatus::Active {
                    self.status = SessionStatus::Degraded;
                }
                self.wiring.events.emit(ObfuscationEvent::HopFailed {
                    session: self.id,
                    hop,
                    retries,
                });
                self.wiring.events.emit(ObfuscationEvent::SessionDegraded {
                    session: self.id,
                    hop,
                });
                self.flush_handoff(now);
            }
        }
    }

    /// Hand data held during a handoff back to the scheduler in original
    /// enqueue order, so it leaves on the session's normal timing
    fn flush_handoff(&mut self, now: Instant) {
        if self.handoff.is_empty() {
            return;
        }
        let mut held = std::mem::take(&mut self.handoff);
        held.sort_by_key(|frame| frame.seq);
        debug!(session = %self.id, frames = held.len(), "Requeueing frames held across hop");
        for frame in held {
            self.counters.handoff_replayed += 1;
            self.scheduler.requeue(frame, now);
        }
    }

    async fn transmit(&mut self, release: Release, now: Instant) {
        match release {
            Release::Idle => {}
            Release::Fill => {
                let frame = self.dummy_frame(now);
                self.send_frame(frame, now).await;
            }
            Release::Frame(frame) => self.send_frame(frame, now).await,
        }
    }

    async fn send_frame(&mut self, frame: OutboundFrame, now: Instant) {
        let pair = match frame.kind {
            // Answer on the pair the peer was last heard on
            FrameKind::Ack => self
                .last_inbound
                .filter(|pair| self.coordinator.live_pairs().contains(pair))
                .or_else(|| self.coordinator.route(FrameKind::Ack)),
            kind => self.coordinator.route(kind),
        };
        let Some(pair) = pair else {
            self.handoff.push(frame);
            return;
        };

        let inner = frame.to_frame(self.recv_window.cumulative_ack()).encode();
        let sealed = self
            .normalizer
            .normalize_into(&inner, frame.padded_len)
            .map_err(SessionError::from)
            .and_then(|padded| self.channel.seal(&padded.bytes).map_err(SessionError::from));
        let datagram = match sealed {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(session = %self.id, error = %e, "Failed to seal frame");
                self.counters.send_errors += 1;
                return;
            }
        };

        let target = SocketAddr::new(self.peer, pair.remote(self.role));
        match self.wiring.pool.socket(pair.local(self.role)).await {
            Some(socket) => {
                if let Err(e) = socket.send_to(&datagram, target).await {
                    debug!(session = %self.id, error = %e, "Send failed");
                    self.counters.send_errors += 1;
                }
            }
            None => {
                debug!(session = %self.id, pair = %pair, "No socket for pair");
                self.counters.send_errors += 1;
            }
        }

        self.ack_due = None;
        match frame.kind {
            FrameKind::Data => {
                self.send_window.on_sent(frame.seq, now);
                self.counters.data_sent += 1;
                self.histogram.record(frame.padded_len);
            }
            FrameKind::Dummy => self.counters.dummies_sent += 1,
            _ => self.counters.control_sent += 1,
        }
        self.wiring.events.emit(ObfuscationEvent::BucketUsed {
            session: self.id,
            bucket: frame.padded_len,
            dummy: frame.kind == FrameKind::Dummy,
        });
    }

    fn enqueue_control(&mut self, frame: OutboundFrame, now: Instant) {
        if let Err(e) = self.scheduler.enqueue(frame, now) {
            debug!(session = %self.id, error = %e, "Control frame not queued");
        }
    }

    /// A frame shaped like real traffic with a random body
    fn shaped_frame(&mut self, kind: FrameKind, now: Instant) -> OutboundFrame {
        let (bucket, len) = dummy_shape(&self.normalizer, &self.histogram, &mut self.rng);
        let mut body = vec![0u8; len];
        self.rng.fill_bytes(&mut body);
        OutboundFrame::new(kind, 0, body, bucket, now)
    }

    fn dummy_frame(&mut self, now: Instant) -> OutboundFrame {
        let lifetime = self.wiring.dummy.rate().interval.max(Duration::from_secs(1));
        self.shaped_frame(FrameKind::Dummy, now)
            .with_deadline(now + lifetime)
    }

    fn control_frame(&mut self, kind: FrameKind, now: Instant) -> OutboundFrame {
        self.shaped_frame(kind, now)
    }

    async fn hold(&mut self, port: u16) {
        match self.wiring.pool.acquire(port).await {
            Ok(_) => *self.held_ports.entry(port).or_insert(0) += 1,
            Err(e) => warn!(session = %self.id, port, error = %e, "Failed to bind hop port"),
        }
    }

    async fn unhold(&mut self, port: u16) {
        let Some(count) = self.held_ports.get_mut(&port) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.held_ports.remove(&port);
        }
        self.wiring.pool.release(port).await;
    }

    async fn teardown(&mut self, reason: CloseReason) {
        let now = Instant::now();
        if matches!(reason, CloseReason::Local | CloseReason::Idle | CloseReason::Shutdown) {
            let close = self.control_frame(FrameKind::Close, now);
            self.send_frame(close, now).await;
        }

        self.scheduler.drain();
        self.handoff.clear();
        let held: Vec<(u16, usize)> = std::mem::take(&mut self.held_ports).into_iter().collect();
        for (port, count) in held {
            for _ in 0..count {
                self.wiring.pool.release(port).await;
            }
        }

        if self.status != SessionStatus::Failed {
            self.status = SessionStatus::Closed;
        }
        info!(
            session = %self.id,
            reason = %reason,
            hop = self.coordinator.state().hop(),
            "Session closed"
        );
        self.wiring.events.emit(ObfuscationEvent::SessionClosed {
            session: self.id,
            reason,
        });
        self.publish();

        self.wiring.registry.write().await.retire(self.id, self.status);
        if let Some(reply) = self.close_reply.take() {
            let _ = reply.send(());
        }
    }

    fn publish(&self) {
        let state = self.coordinator.state();
        self.wiring.snapshot.send_replace(SessionSnapshot {
            id: self.id,
            status: self.status,
            hop: state.hop(),
            hop_state: state.name(),
            bound_ports: self.held_ports.keys().copied().collect(),
            queue_depth: self.scheduler.depth(),
            real_queued: self.scheduler.real_depth(),
            handoff_buffered: self.handoff.len(),
            in_flight: self.send_window.in_flight(),
            histogram: self.histogram.clone(),
            counters: self.counters,
            scheduler: self.scheduler.stats(),
            history: self.coordinator.history().to_vec(),
        });
    }
}
