//! Transmission scheduler
//!
//! Decides when each outbound frame leaves. In randomized mode every frame
//! is held for an independent random delay; in fixed-interval mode there
//! is one transmission slot every `base ± jitter` and a slot carries at
//! most one frame (control first, then data, then cover).
//!
//! The scheduler is pure: it is driven with explicit instants and never
//! sleeps. The session actor polls it at `next_wakeup()`.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use shroud_protocol::{FrameKind, OutboundFrame};
use tokio::time::Instant;
use tracing::trace;

use crate::errors::{TimingError, TimingResult};
use crate::jitter::{JitterMode, JitterPolicy};
use crate::stats::{DelayStats, SchedulerStats};

/// Result of handing a frame to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Frame queued
    Queued,
    /// Frame queued after evicting the oldest queued dummy
    DisplacedDummy,
    /// Queue full; the new dummy was dropped
    DummyDiscarded,
}

/// What the scheduler wants sent right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Send this frame
    Frame(OutboundFrame),
    /// A fixed slot with nothing queued; send a fresh dummy
    Fill,
    /// A fixed slot with nothing queued and cover disabled
    Idle,
}

/// Per-session transmission scheduler
pub struct TransmissionScheduler {
    policy: JitterPolicy,
    bound: usize,
    queue: BTreeMap<(Instant, u64), OutboundFrame>,
    order: u64,
    next_tick: Option<Instant>,
    cover: bool,
    rng: StdRng,
    stats: SchedulerStats,
    delays: DelayStats,
}

impl TransmissionScheduler {
    /// Create a scheduler holding at most `bound` data and dummy frames
    pub fn new(policy: JitterPolicy, bound: usize, now: Instant) -> TimingResult<Self> {
        Self::with_rng(policy, bound, now, StdRng::from_entropy())
    }

    /// Create a scheduler with a specific RNG
    pub fn with_rng(
        policy: JitterPolicy,
        bound: usize,
        now: Instant,
        mut rng: StdRng,
    ) -> TimingResult<Self> {
        policy.validate()?;
        if bound == 0 {
            return Err(TimingError::InvalidConfig("queue bound cannot be 0".into()));
        }

        let next_tick = policy.is_fixed_interval().then(|| now + policy.draw(&mut rng));

        Ok(Self {
            policy,
            bound,
            queue: BTreeMap::new(),
            order: 0,
            next_tick,
            cover: false,
            rng,
            stats: SchedulerStats::default(),
            delays: DelayStats::new(),
        })
    }

    /// Get the jitter policy
    pub fn policy(&self) -> &JitterPolicy {
        &self.policy
    }

    /// Get the queue bound
    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Enable or disable filling empty fixed slots with cover
    pub fn set_cover(&mut self, cover: bool) {
        self.cover = cover;
    }

    pub fn cover(&self) -> bool {
        self.cover
    }

    /// Frames currently queued, control included
    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    /// Data and dummy frames queued; this is what the bound applies to
    pub fn bounded_depth(&self) -> usize {
        self.queue.values().filter(|f| !f.kind.is_control()).count()
    }

    /// Queued data frames
    pub fn real_depth(&self) -> usize {
        self.queue.values().filter(|f| f.kind.is_real()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get counters
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Get observed queueing delays
    pub fn delays(&self) -> &DelayStats {
        &self.delays
    }

    /// Queue a frame.
    ///
    /// When the queue is at its bound the oldest dummy is evicted for a
    /// real frame; a new dummy is simply dropped; a real frame with no
    /// dummy to evict is refused. Control frames are never refused.
    pub fn enqueue(&mut self, frame: OutboundFrame, now: Instant) -> TimingResult<EnqueueOutcome> {
        if frame.kind.is_control() {
            self.insert(frame, now);
            return Ok(EnqueueOutcome::Queued);
        }

        let depth = self.bounded_depth();
        if depth < self.bound {
            self.insert(frame, now);
            return Ok(EnqueueOutcome::Queued);
        }

        if frame.kind == FrameKind::Dummy {
            self.stats.dummies_discarded += 1;
            return Ok(EnqueueOutcome::DummyDiscarded);
        }

        match self.oldest_dummy() {
            Some(key) => {
                self.queue.remove(&key);
                self.stats.dummies_displaced += 1;
                self.insert(frame, now);
                Ok(EnqueueOutcome::DisplacedDummy)
            }
            None => {
                self.stats.backpressure += 1;
                Err(TimingError::Backpressure {
                    depth,
                    bound: self.bound,
                })
            }
        }
    }

    /// Queue a retransmission; retransmissions bypass the bound
    pub fn requeue(&mut self, frame: OutboundFrame, now: Instant) {
        self.insert(frame, now);
    }

    /// Release whatever is due at `now`.
    ///
    /// Returns `None` when nothing is due. Call repeatedly until `None` to
    /// drain every frame whose delay has elapsed.
    pub fn poll_release(&mut self, now: Instant) -> Option<Release> {
        match self.policy.mode {
            JitterMode::RandomizedDelay { .. } => loop {
                let key = *self.queue.keys().next()?;
                if key.0 > now {
                    return None;
                }
                let frame = self.queue.remove(&key)?;
                if frame.kind == FrameKind::Dummy && frame.is_expired(now) {
                    self.stats.dummies_expired += 1;
                    continue;
                }
                return Some(Release::Frame(self.released(frame, now)));
            },
            JitterMode::FixedInterval { .. } => {
                let tick = self.next_tick?;
                if now < tick {
                    return None;
                }

                let gap = self.policy.draw(&mut self.rng);
                let mut next = tick + gap;
                if next <= now {
                    // Fell behind; restart the cadence from here
                    next = now + gap;
                }
                self.next_tick = Some(next);

                self.purge_expired(now);
                let key = self
                    .first_due(now, |k| k.is_control())
                    .or_else(|| self.first_due(now, FrameKind::is_real))
                    .or_else(|| self.first_due(now, |k| k == FrameKind::Dummy));

                match key.and_then(|k| self.queue.remove(&k)) {
                    Some(frame) => Some(Release::Frame(self.released(frame, now))),
                    None if self.cover => {
                        self.stats.fill_ticks += 1;
                        Some(Release::Fill)
                    }
                    None => {
                        self.stats.idle_ticks += 1;
                        Some(Release::Idle)
                    }
                }
            }
        }
    }

    /// When the scheduler next has something to do
    pub fn next_wakeup(&self) -> Option<Instant> {
        match self.policy.mode {
            JitterMode::RandomizedDelay { .. } => self.queue.keys().next().map(|(at, _)| *at),
            JitterMode::FixedInterval { .. } => self.next_tick,
        }
    }

    /// Remove and return everything queued, in release order
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        std::mem::take(&mut self.queue).into_values().collect()
    }

    fn insert(&mut self, frame: OutboundFrame, now: Instant) {
        let release_at = match self.policy.mode {
            JitterMode::RandomizedDelay { .. } => now + self.policy.draw(&mut self.rng),
            JitterMode::FixedInterval { .. } => now,
        }
        .max(frame.earliest_send);

        trace!(kind = ?frame.kind, seq = frame.seq, "Queued frame");
        self.queue.insert((release_at, self.order), frame);
        self.order += 1;
        self.stats.enqueued += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.queue.len());
    }

    fn released(&mut self, frame: OutboundFrame, now: Instant) -> OutboundFrame {
        self.stats.released += 1;
        self.delays.record(now.saturating_duration_since(frame.earliest_send));
        frame
    }

    fn oldest_dummy(&self) -> Option<(Instant, u64)> {
        self.queue
            .iter()
            .filter(|(_, f)| f.kind == FrameKind::Dummy)
            .min_by_key(|((_, order), _)| *order)
            .map(|(key, _)| *key)
    }

    fn first_due(&self, now: Instant, pred: impl Fn(FrameKind) -> bool) -> Option<(Instant, u64)> {
        self.queue
            .iter()
            .take_while(|((at, _), _)| *at <= now)
            .find(|(_, f)| pred(f.kind))
            .map(|(key, _)| *key)
    }

    fn purge_expired(&mut self, now: Instant) {
        let before = self.queue.len();
        self.queue
            .retain(|_, f| !(f.kind == FrameKind::Dummy && f.is_expired(now)));
        self.stats.dummies_expired += (before - self.queue.len()) as u64;
    }
}

impl std::fmt::Debug for TransmissionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionScheduler")
            .field("policy", &self.policy)
            .field("bound", &self.bound)
            .field("depth", &self.queue.len())
            .field("next_tick", &self.next_tick)
            .field("cover", &self.cover)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn data(seq: u64, now: Instant) -> OutboundFrame {
        OutboundFrame::new(FrameKind::Data, seq, vec![seq as u8; 8], 256, now)
    }

    fn dummy(now: Instant) -> OutboundFrame {
        OutboundFrame::new(FrameKind::Dummy, 0, vec![0; 8], 256, now)
    }

    fn ack(now: Instant) -> OutboundFrame {
        OutboundFrame::new(FrameKind::Ack, 0, Vec::new(), 256, now)
    }

    fn randomized(bound: usize, now: Instant) -> TransmissionScheduler {
        TransmissionScheduler::with_rng(
            JitterPolicy::randomized(ms(50), ms(500)),
            bound,
            now,
            StdRng::seed_from_u64(7),
        )
        .unwrap()
    }

    fn fixed(bound: usize, now: Instant) -> TransmissionScheduler {
        TransmissionScheduler::with_rng(
            JitterPolicy::fixed(ms(100), Duration::ZERO),
            bound,
            now,
            StdRng::seed_from_u64(7),
        )
        .unwrap()
    }

    fn released_seq(release: Option<Release>) -> Option<u64> {
        match release {
            Some(Release::Frame(f)) => Some(f.seq),
            _ => None,
        }
    }

    #[test]
    fn test_invalid_construction() {
        let now = Instant::now();
        assert!(TransmissionScheduler::new(JitterPolicy::default(), 0, now).is_err());
        let inverted = JitterPolicy::randomized(ms(10), ms(5));
        assert!(TransmissionScheduler::new(inverted, 8, now).is_err());
    }

    #[test]
    fn test_randomized_delay_within_window() {
        let start = Instant::now();
        let mut sched = randomized(64, start);
        for seq in 1..=50 {
            sched.enqueue(data(seq, start), start).unwrap();
        }

        assert!(sched.poll_release(start + ms(49)).is_none());
        let wake = sched.next_wakeup().unwrap();
        assert!(wake >= start + ms(50) && wake <= start + ms(500));

        let mut released = 0;
        while let Some(release) = sched.poll_release(start + ms(500)) {
            assert!(matches!(release, Release::Frame(_)));
            released += 1;
        }
        assert_eq!(released, 50);
        assert!(sched.is_empty());
        assert!(sched.next_wakeup().is_none());

        let delays = sched.delays();
        assert!(delays.min() >= ms(50));
        assert!(delays.max() <= ms(500));
    }

    #[test]
    fn test_earliest_send_respected() {
        let start = Instant::now();
        let mut sched = randomized(8, start);
        let mut frame = data(1, start);
        frame.earliest_send = start + ms(2000);
        sched.requeue(frame, start);

        assert!(sched.poll_release(start + ms(1999)).is_none());
        assert_eq!(released_seq(sched.poll_release(start + ms(2000))), Some(1));
    }

    #[test]
    fn test_backpressure_for_real_frames() {
        let now = Instant::now();
        let mut sched = randomized(4, now);
        for seq in 1..=4 {
            assert_eq!(sched.enqueue(data(seq, now), now).unwrap(), EnqueueOutcome::Queued);
        }

        let err = sched.enqueue(data(5, now), now).unwrap_err();
        assert_eq!(err, TimingError::Backpressure { depth: 4, bound: 4 });
        assert_eq!(sched.stats().backpressure, 1);

        // Control frames and retransmissions bypass the bound
        assert_eq!(sched.enqueue(ack(now), now).unwrap(), EnqueueOutcome::Queued);
        sched.requeue(data(1, now), now);
        assert_eq!(sched.depth(), 6);
        assert_eq!(sched.real_depth(), 5);
    }

    #[test]
    fn test_dummies_yield_to_real_frames() {
        let now = Instant::now();
        let mut sched = randomized(3, now);
        sched.enqueue(dummy(now), now).unwrap();
        sched.enqueue(dummy(now + ms(1)), now + ms(1)).unwrap();
        sched.enqueue(data(1, now), now).unwrap();

        assert_eq!(
            sched.enqueue(data(2, now), now).unwrap(),
            EnqueueOutcome::DisplacedDummy
        );
        assert_eq!(sched.bounded_depth(), 3);
        assert_eq!(sched.real_depth(), 2);

        assert_eq!(
            sched.enqueue(dummy(now), now).unwrap(),
            EnqueueOutcome::DummyDiscarded
        );

        let stats = sched.stats();
        assert_eq!(stats.dummies_displaced, 1);
        assert_eq!(stats.dummies_discarded, 1);
    }

    #[test]
    fn test_expired_dummy_is_dropped() {
        let now = Instant::now();
        let mut sched = randomized(8, now);
        sched.enqueue(dummy(now).with_deadline(now + ms(10)), now).unwrap();

        assert!(sched.poll_release(now + ms(500)).is_none());
        assert_eq!(sched.stats().dummies_expired, 1);
        assert_eq!(sched.stats().released, 0);
    }

    #[test]
    fn test_fixed_interval_one_frame_per_slot() {
        let start = Instant::now();
        let mut sched = fixed(16, start);
        for seq in 1..=3 {
            sched.enqueue(data(seq, start), start).unwrap();
        }

        assert_eq!(sched.next_wakeup(), Some(start + ms(100)));
        assert!(sched.poll_release(start + ms(99)).is_none());
        assert_eq!(released_seq(sched.poll_release(start + ms(100))), Some(1));
        assert!(sched.poll_release(start + ms(150)).is_none());
        assert_eq!(released_seq(sched.poll_release(start + ms(200))), Some(2));
        assert_eq!(released_seq(sched.poll_release(start + ms(300))), Some(3));
        assert_eq!(sched.poll_release(start + ms(400)), Some(Release::Idle));
    }

    #[test]
    fn test_fixed_interval_priority() {
        let start = Instant::now();
        let mut sched = fixed(16, start);
        sched.enqueue(dummy(start), start).unwrap();
        sched.enqueue(data(1, start), start).unwrap();
        sched.enqueue(ack(start), start).unwrap();

        let kinds: Vec<FrameKind> = (1..=3)
            .filter_map(|i| match sched.poll_release(start + ms(100 * i)) {
                Some(Release::Frame(f)) => Some(f.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![FrameKind::Ack, FrameKind::Data, FrameKind::Dummy]);
    }

    #[test]
    fn test_fixed_interval_fill_with_cover() {
        let start = Instant::now();
        let mut sched = fixed(16, start);
        sched.set_cover(true);
        assert_eq!(sched.poll_release(start + ms(100)), Some(Release::Fill));
        sched.set_cover(false);
        assert_eq!(sched.poll_release(start + ms(200)), Some(Release::Idle));

        let stats = sched.stats();
        assert_eq!(stats.fill_ticks, 1);
        assert_eq!(stats.idle_ticks, 1);
    }

    #[test]
    fn test_fixed_interval_resyncs_after_stall() {
        let start = Instant::now();
        let mut sched = fixed(16, start);
        assert!(sched.poll_release(start + ms(1000)).is_some());
        // No burst of missed slots
        assert_eq!(sched.next_wakeup(), Some(start + ms(1100)));
        assert!(sched.poll_release(start + ms(1050)).is_none());
    }

    #[test]
    fn test_drain() {
        let now = Instant::now();
        let mut sched = randomized(8, now);
        sched.enqueue(data(1, now), now).unwrap();
        sched.enqueue(ack(now), now).unwrap();
        assert_eq!(sched.drain().len(), 2);
        assert!(sched.is_empty());
    }
}
