//! Frequency-Hopping Coordinator
//!
//! Per-session state machine that moves a session from one port pair to
//! the next without a rendezvous message:
//!
//! ```text
//!   Bound(old) --hop instant--> Handoff(old, new) --auth on new--> Bound(new)
//!                                   |        ^
//!                      retries spent|        |hop instant (target jumps)
//!                                   v        |
//!                              Degraded(old, new) --auth on new--> Bound(new)
//! ```
//!
//! The coordinator performs no I/O. It is driven by [`HopCoordinator::poll`]
//! and [`HopCoordinator::on_authenticated`] and answers with [`HopAction`]s
//! for the session runtime to carry out.

use std::time::Duration;

use shroud_crypto::Role;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::frame::FrameKind;
use crate::hopping::{HopSchedule, PortPair};

/// Handoff timing knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopTiming {
    /// Minimum time both pairs stay live after a hop instant
    pub overlap: Duration,
    /// Time the old pair stays live after confirmation
    pub grace: Duration,
    /// Wait for an authenticated datagram before re-probing
    pub hop_timeout: Duration,
    /// Probe retries before the session is declared degraded
    pub max_retries: u32,
    /// Ceiling for the probe interval while degraded
    pub max_probe_interval: Duration,
}

/// Where a session is in its hop cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopState {
    /// One confirmed pair
    Bound { hop: u64, pair: PortPair },
    /// Both pairs live, waiting for the peer to show up on `new`
    Handoff {
        hop: u64,
        old: PortPair,
        new: PortPair,
        retries: u32,
    },
    /// Retries spent; traffic stays on `old` while `new` is probed with backoff
    Degraded {
        hop: u64,
        old: PortPair,
        new: PortPair,
        probes: u32,
    },
}

impl HopState {
    /// Hop index this state is for (target hop while handing off)
    pub fn hop(&self) -> u64 {
        match *self {
            HopState::Bound { hop, .. }
            | HopState::Handoff { hop, .. }
            | HopState::Degraded { hop, .. } => hop,
        }
    }

    /// Last pair the peer is known to use
    pub fn confirmed_pair(&self) -> PortPair {
        match *self {
            HopState::Bound { pair, .. } => pair,
            HopState::Handoff { old, .. } | HopState::Degraded { old, .. } => old,
        }
    }

    /// Get state name for logging
    pub fn name(&self) -> &'static str {
        match self {
            HopState::Bound { .. } => "Bound",
            HopState::Handoff { .. } => "Handoff",
            HopState::Degraded { .. } => "Degraded",
        }
    }
}

/// Work the session runtime must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopAction {
    /// Open the local socket for a pair
    Bind(PortPair),
    /// Close the local socket for a pair
    Release(PortPair),
    /// Send a probe on a pair
    Probe(PortPair),
    /// A hop began
    Started { hop: u64, old: PortPair, new: PortPair },
    /// A probe went unanswered and was re-sent
    Retry { hop: u64, attempt: u32 },
    /// The peer showed up on the new pair
    Confirmed {
        hop: u64,
        pair: PortPair,
        recovered: bool,
    },
    /// Retries exhausted
    Degraded { hop: u64, retries: u32 },
}

/// One entry of a session's hop history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopRecord {
    /// Hop index
    pub hop: u64,
    /// Pair used during the hop
    pub pair: PortPair,
    /// Confirmation time
    pub bound_at: Instant,
    /// Time the pair's sockets were released
    pub retired_at: Option<Instant>,
}

/// Per-session hop state machine
#[derive(Debug)]
pub struct HopCoordinator {
    role: Role,
    schedule: HopSchedule,
    timing: HopTiming,
    epoch: Instant,
    state: HopState,
    next_hop_at: Option<Instant>,
    probe_deadline: Option<Instant>,
    retiring: Vec<(PortPair, Instant)>,
    history: Vec<HopRecord>,
}

impl HopCoordinator {
    /// Create a coordinator bound to hop 0.
    ///
    /// `epoch` is the instant the handshake completed; both peers measure
    /// the schedule from their own copy of it.
    pub fn new(role: Role, schedule: HopSchedule, timing: HopTiming, epoch: Instant) -> Self {
        let pair = schedule.pair(0);
        let next_hop_at = if schedule.params().enabled {
            Some(schedule.instant(epoch, 1))
        } else {
            None
        };

        Self {
            role,
            schedule,
            timing,
            epoch,
            state: HopState::Bound { hop: 0, pair },
            next_hop_at,
            probe_deadline: None,
            retiring: Vec::new(),
            history: vec![HopRecord {
                hop: 0,
                pair,
                bound_at: epoch,
                retired_at: None,
            }],
        }
    }

    /// Actions needed to go live on hop 0
    pub fn start(&self) -> Vec<HopAction> {
        vec![HopAction::Bind(self.state.confirmed_pair())]
    }

    /// Get current state
    pub fn state(&self) -> HopState {
        self.state
    }

    /// Get the role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the schedule
    pub fn schedule(&self) -> &HopSchedule {
        &self.schedule
    }

    /// Get hop history (monotonic in hop index)
    pub fn history(&self) -> &[HopRecord] {
        &self.history
    }

    /// Check if the session is degraded
    pub fn is_degraded(&self) -> bool {
        matches!(self.state, HopState::Degraded { .. })
    }

    /// Every pair with a live socket, including pairs awaiting retirement
    pub fn live_pairs(&self) -> Vec<PortPair> {
        let mut pairs = match self.state {
            HopState::Bound { pair, .. } => vec![pair],
            HopState::Handoff { old, new, .. } | HopState::Degraded { old, new, .. } => {
                vec![old, new]
            }
        };
        pairs.extend(self.retiring.iter().map(|(pair, _)| *pair));
        pairs
    }

    /// Live pair whose local port is `port`
    pub fn pair_for_local_port(&self, port: u16) -> Option<PortPair> {
        self.live_pairs()
            .into_iter()
            .rev()
            .find(|pair| pair.local(self.role) == port)
    }

    /// Pair a frame of `kind` should leave on, or `None` to hold it until
    /// the handoff settles
    pub fn route(&self, kind: FrameKind) -> Option<PortPair> {
        match self.state {
            HopState::Bound { pair, .. } => Some(pair),
            HopState::Handoff { old, new, .. } => match kind {
                FrameKind::Data => None,
                FrameKind::Probe => Some(new),
                _ => Some(old),
            },
            HopState::Degraded { old, new, .. } => match kind {
                FrameKind::Probe => Some(new),
                _ => Some(old),
            },
        }
    }

    /// Earliest instant [`HopCoordinator::poll`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.retiring
            .iter()
            .map(|(_, at)| *at)
            .chain(self.next_hop_at)
            .chain(self.probe_deadline)
            .min()
    }

    /// Advance timers
    pub fn poll(&mut self, now: Instant) -> Vec<HopAction> {
        let mut actions = Vec::new();

        self.retire_due(now, &mut actions);

        if self.next_hop_at.map_or(false, |at| now >= at) {
            self.begin_hop(now, &mut actions);
        }

        if self.probe_deadline.map_or(false, |at| now >= at) {
            self.probe_timeout(now, &mut actions);
        }

        actions
    }

    /// An authenticated datagram arrived on local port `local_port`
    pub fn on_authenticated(&mut self, local_port: u16, now: Instant) -> Vec<HopAction> {
        let (hop, old, new, recovered) = match self.state {
            HopState::Bound { .. } => return Vec::new(),
            HopState::Handoff { hop, old, new, .. } => (hop, old, new, false),
            HopState::Degraded { hop, old, new, .. } => (hop, old, new, true),
        };
        if new.local(self.role) != local_port {
            return Vec::new();
        }

        let retire_at = (now + self.timing.grace)
            .max(self.schedule.instant(self.epoch, hop) + self.timing.overlap);

        self.state = HopState::Bound { hop, pair: new };
        self.probe_deadline = None;
        self.retiring.push((old, retire_at));
        self.history.push(HopRecord {
            hop,
            pair: new,
            bound_at: now,
            retired_at: None,
        });

        info!(hop, pair = %new, recovered, "Hop confirmed");
        vec![HopAction::Confirmed {
            hop,
            pair: new,
            recovered,
        }]
    }

    fn retire_due(&mut self, now: Instant, actions: &mut Vec<HopAction>) {
        let mut i = 0;
        while i < self.retiring.len() {
            if self.retiring[i].1 <= now {
                let (pair, _) = self.retiring.remove(i);
                if let Some(record) = self
                    .history
                    .iter_mut()
                    .rev()
                    .find(|r| r.pair == pair && r.retired_at.is_none())
                {
                    record.retired_at = Some(now);
                }
                debug!(pair = %pair, "Retiring port pair");
                actions.push(HopAction::Release(pair));
            } else {
                i += 1;
            }
        }
    }

    fn begin_hop(&mut self, now: Instant, actions: &mut Vec<HopAction>) {
        let hop = self.schedule.hop_at(self.epoch, now);
        self.next_hop_at = Some(self.schedule.instant(self.epoch, hop + 1));
        if hop <= self.state.hop() {
            return;
        }

        let new = self.schedule.pair(hop);
        let old = self.state.confirmed_pair();
        self.state = match self.state {
            HopState::Bound { .. } => HopState::Handoff {
                hop,
                old,
                new,
                retries: 0,
            },
            HopState::Handoff { new: stale, .. } => {
                actions.push(HopAction::Release(stale));
                HopState::Handoff {
                    hop,
                    old,
                    new,
                    retries: 0,
                }
            }
            HopState::Degraded { new: stale, .. } => {
                actions.push(HopAction::Release(stale));
                HopState::Degraded {
                    hop,
                    old,
                    new,
                    probes: 0,
                }
            }
        };

        debug!(hop, old = %old, new = %new, "Hop started");
        actions.push(HopAction::Started { hop, old, new });
        actions.push(HopAction::Bind(new));
        actions.push(HopAction::Probe(new));
        self.probe_deadline = Some(now + self.timing.hop_timeout);
    }

    fn probe_timeout(&mut self, now: Instant, actions: &mut Vec<HopAction>) {
        match self.state {
            HopState::Bound { .. } => {
                self.probe_deadline = None;
            }
            HopState::Handoff {
                hop,
                old,
                new,
                retries,
            } => {
                // Same hop, same seed: re-deriving gives the same pair.
                let target = self.schedule.pair(hop);
                if retries < self.timing.max_retries {
                    let attempt = retries + 1;
                    self.state = HopState::Handoff {
                        hop,
                        old,
                        new,
                        retries: attempt,
                    };
                    debug!(hop, attempt, "Hop probe unanswered, retrying");
                    actions.push(HopAction::Retry { hop, attempt });
                    actions.push(HopAction::Probe(target));
                    self.probe_deadline = Some(now + self.timing.hop_timeout);
                } else {
                    self.state = HopState::Degraded {
                        hop,
                        old,
                        new,
                        probes: 0,
                    };
                    warn!(hop, retries, "Hop confirmation timed out, session degraded");
                    actions.push(HopAction::Degraded { hop, retries });
                    actions.push(HopAction::Probe(target));
                    self.probe_deadline = Some(now + self.probe_interval(0));
                }
            }
            HopState::Degraded {
                hop,
                old,
                new,
                probes,
            } => {
                let probes = probes.saturating_add(1);
                self.state = HopState::Degraded {
                    hop,
                    old,
                    new,
                    probes,
                };
                actions.push(HopAction::Probe(self.schedule.pair(hop)));
                self.probe_deadline = Some(now + self.probe_interval(probes));
            }
        }
    }

    fn probe_interval(&self, probes: u32) -> Duration {
        let factor = 1u32 << probes.min(16);
        self.timing
            .hop_timeout
            .saturating_mul(factor)
            .min(self.timing.max_probe_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hopping::{HopParameters, PortRange};

    const SEED: [u8; 32] = [11u8; 32];

    fn timing() -> HopTiming {
        HopTiming {
            overlap: Duration::from_secs(5),
            grace: Duration::from_secs(2),
            hop_timeout: Duration::from_secs(2),
            max_retries: 3,
            max_probe_interval: Duration::from_secs(30),
        }
    }

    fn schedule(enabled: bool) -> HopSchedule {
        HopSchedule::new(
            &SEED,
            HopParameters {
                enabled,
                interval: Duration::from_secs(30),
                jitter: Duration::ZERO,
                ports: PortRange::new(20_000, 60_000).unwrap(),
            },
        )
        .unwrap()
    }

    fn coordinator(role: Role, epoch: Instant) -> HopCoordinator {
        HopCoordinator::new(role, schedule(true), timing(), epoch)
    }

    #[test]
    fn test_starts_bound_on_hop_zero() {
        let epoch = Instant::now();
        let c = coordinator(Role::Client, epoch);
        let pair0 = schedule(true).pair(0);

        assert_eq!(c.start(), vec![HopAction::Bind(pair0)]);
        assert_eq!(c.state(), HopState::Bound { hop: 0, pair: pair0 });
        assert_eq!(c.route(FrameKind::Data), Some(pair0));
        assert_eq!(c.next_deadline(), Some(epoch + Duration::from_secs(30)));
    }

    #[test]
    fn test_hop_instant_starts_handoff() {
        let epoch = Instant::now();
        let mut c = coordinator(Role::Client, epoch);
        let s = schedule(true);

        assert!(c.poll(epoch + Duration::from_secs(29)).is_empty());

        let actions = c.poll(epoch + Duration::from_secs(30));
        assert_eq!(
            actions,
            vec![
                HopAction::Started { hop: 1, old: s.pair(0), new: s.pair(1) },
                HopAction::Bind(s.pair(1)),
                HopAction::Probe(s.pair(1)),
            ]
        );
        assert_eq!(c.route(FrameKind::Data), None);
        assert_eq!(c.route(FrameKind::Dummy), Some(s.pair(0)));
        assert_eq!(c.route(FrameKind::Probe), Some(s.pair(1)));
        assert_eq!(c.live_pairs(), vec![s.pair(0), s.pair(1)]);
    }

    #[test]
    fn test_confirmation_and_retirement() {
        let epoch = Instant::now();
        let mut c = coordinator(Role::Server, epoch);
        let s = schedule(true);
        let hop_at = epoch + Duration::from_secs(30);
        c.poll(hop_at);

        // Traffic on the old port does not confirm
        let old_port = s.pair(0).local(Role::Server);
        assert!(c.on_authenticated(old_port, hop_at).is_empty());

        let confirm_at = hop_at + Duration::from_millis(400);
        let actions = c.on_authenticated(s.pair(1).local(Role::Server), confirm_at);
        assert_eq!(
            actions,
            vec![HopAction::Confirmed { hop: 1, pair: s.pair(1), recovered: false }]
        );
        assert_eq!(c.state(), HopState::Bound { hop: 1, pair: s.pair(1) });

        // Old pair survives until hop instant + overlap (later than confirm + grace)
        assert!(c.poll(hop_at + Duration::from_millis(4_999)).is_empty());
        let actions = c.poll(hop_at + Duration::from_secs(5));
        assert_eq!(actions, vec![HopAction::Release(s.pair(0))]);

        let history = c.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].hop, 0);
        assert!(history[0].retired_at.is_some());
        assert_eq!(history[1].hop, 1);
        assert_eq!(history[1].bound_at, confirm_at);
    }

    #[test]
    fn test_late_confirmation_uses_grace() {
        let epoch = Instant::now();
        let mut c = coordinator(Role::Client, epoch);
        let s = schedule(true);
        let hop_at = epoch + Duration::from_secs(30);
        c.poll(hop_at);
        c.poll(hop_at + Duration::from_secs(2)); // first retry

        let confirm_at = hop_at + Duration::from_secs(4);
        c.on_authenticated(s.pair(1).local(Role::Client), confirm_at);

        assert!(c.poll(hop_at + Duration::from_secs(5)).is_empty());
        assert_eq!(
            c.poll(confirm_at + Duration::from_secs(2)),
            vec![HopAction::Release(s.pair(0))]
        );
    }

    #[test]
    fn test_retries_then_degraded_then_recovered() {
        let epoch = Instant::now();
        let mut c = coordinator(Role::Client, epoch);
        let s = schedule(true);
        let hop_at = epoch + Duration::from_secs(30);
        c.poll(hop_at);

        for attempt in 1..=3u32 {
            let actions = c.poll(hop_at + Duration::from_secs(2 * attempt as u64));
            assert_eq!(
                actions,
                vec![HopAction::Retry { hop: 1, attempt }, HopAction::Probe(s.pair(1))]
            );
        }

        let actions = c.poll(hop_at + Duration::from_secs(8));
        assert_eq!(
            actions,
            vec![HopAction::Degraded { hop: 1, retries: 3 }, HopAction::Probe(s.pair(1))]
        );
        assert!(c.is_degraded());
        assert_eq!(c.route(FrameKind::Data), Some(s.pair(0)));

        // Backoff: next probe after 2s, then 4s
        assert_eq!(
            c.poll(hop_at + Duration::from_secs(10)),
            vec![HopAction::Probe(s.pair(1))]
        );
        assert!(c.poll(hop_at + Duration::from_secs(13)).is_empty());
        assert_eq!(
            c.poll(hop_at + Duration::from_secs(14)),
            vec![HopAction::Probe(s.pair(1))]
        );

        let actions =
            c.on_authenticated(s.pair(1).local(Role::Client), hop_at + Duration::from_secs(15));
        assert_eq!(
            actions,
            vec![HopAction::Confirmed { hop: 1, pair: s.pair(1), recovered: true }]
        );
        assert!(!c.is_degraded());
    }

    #[test]
    fn test_next_hop_during_handoff_jumps_forward() {
        let epoch = Instant::now();
        let mut c = coordinator(Role::Client, epoch);
        let s = schedule(true);
        c.poll(epoch + Duration::from_secs(30));

        // Never confirmed; drain the retries
        for t in [32u64, 34, 36, 38] {
            c.poll(epoch + Duration::from_secs(t));
        }
        assert!(c.is_degraded());

        let actions = c.poll(epoch + Duration::from_secs(60));
        assert!(actions.contains(&HopAction::Release(s.pair(1))));
        assert!(actions.contains(&HopAction::Bind(s.pair(2))));
        assert_eq!(c.state().hop(), 2);
        assert_eq!(c.state().confirmed_pair(), s.pair(0));

        c.on_authenticated(s.pair(2).local(Role::Client), epoch + Duration::from_secs(61));
        let hops: Vec<u64> = c.history().iter().map(|r| r.hop).collect();
        assert_eq!(hops, vec![0, 2]);
    }

    #[test]
    fn test_missed_hops_skip_to_latest() {
        let epoch = Instant::now();
        let mut c = coordinator(Role::Client, epoch);
        let actions = c.poll(epoch + Duration::from_secs(95));
        assert!(actions.contains(&HopAction::Bind(schedule(true).pair(3))));
        assert_eq!(c.state().hop(), 3);
    }

    #[test]
    fn test_peers_agree_on_pairs() {
        let epoch = Instant::now();
        let mut client = coordinator(Role::Client, epoch);
        let mut server = coordinator(Role::Server, epoch + Duration::from_millis(150));

        client.poll(epoch + Duration::from_secs(31));
        server.poll(epoch + Duration::from_secs(31));

        match (client.state(), server.state()) {
            (HopState::Handoff { new: a, .. }, HopState::Handoff { new: b, .. }) => {
                assert_eq!(a, b)
            }
            other => panic!("unexpected states {:?}", other),
        }
    }

    #[test]
    fn test_disabled_never_hops() {
        let epoch = Instant::now();
        let mut c = HopCoordinator::new(Role::Client, schedule(false), timing(), epoch);
        assert_eq!(c.next_deadline(), None);
        assert!(c.poll(epoch + Duration::from_secs(3600)).is_empty());
        assert_eq!(c.state().hop(), 0);
    }

    #[test]
    fn test_pair_for_local_port() {
        let epoch = Instant::now();
        let mut c = coordinator(Role::Client, epoch);
        let s = schedule(true);
        c.poll(epoch + Duration::from_secs(30));

        assert_eq!(c.pair_for_local_port(s.pair(1).client_port), Some(s.pair(1)));
        assert_eq!(c.pair_for_local_port(s.pair(0).client_port), Some(s.pair(0)));
        assert_eq!(c.pair_for_local_port(1), None);
    }
}
