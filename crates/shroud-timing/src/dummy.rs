//! Cover traffic
//!
//! A dummy generator ticks at a randomized rate and asks its session for
//! a dummy frame each time. Dummy sizes follow the buckets real traffic
//! has been using so cover cannot be told apart by size.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use shroud_protocol::{PaddingNormalizer, FRAME_HEADER_LEN};
use tokio::sync::watch;
use tracing::debug;

use crate::errors::{TimingError, TimingResult};
use crate::jitter::sample_interval;
use crate::stats::BucketHistogram;

/// Smallest enabled dummy interval
pub const MIN_DUMMY_INTERVAL: Duration = Duration::from_millis(10);

/// Cover traffic rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DummyRate {
    /// Mean gap between dummies; zero disables cover traffic
    pub interval: Duration,
    /// Uniform jitter around the mean
    pub jitter: Duration,
}

impl DummyRate {
    /// No cover traffic
    pub fn disabled() -> Self {
        Self {
            interval: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// One dummy every `interval ± jitter`
    pub fn every(interval: Duration, jitter: Duration) -> Self {
        Self { interval, jitter }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Validate the rate
    pub fn validate(&self) -> TimingResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.interval < MIN_DUMMY_INTERVAL {
            return Err(TimingError::InvalidConfig(format!(
                "dummy interval {:?} below {:?}",
                self.interval, MIN_DUMMY_INTERVAL
            )));
        }
        if self.jitter >= self.interval {
            return Err(TimingError::InvalidConfig(format!(
                "dummy jitter {:?} must be below the interval {:?}",
                self.jitter, self.interval
            )));
        }
        Ok(())
    }

    /// Gap until the next dummy, or `None` when disabled
    pub fn draw_interval<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Duration> {
        self.is_enabled()
            .then(|| sample_interval(self.interval, self.jitter, rng))
    }
}

impl Default for DummyRate {
    fn default() -> Self {
        Self::every(Duration::from_secs(2), Duration::from_secs(1))
    }
}

/// Pick a `(bucket, body_len)` for a dummy.
///
/// Buckets are weighted by how often real traffic used them; with no
/// history every bucket is equally likely.
pub fn dummy_shape<R: Rng + ?Sized>(
    normalizer: &PaddingNormalizer,
    histogram: &BucketHistogram,
    rng: &mut R,
) -> (usize, usize) {
    let buckets = normalizer.buckets();
    let total = histogram.total();

    let bucket = if total == 0 {
        buckets[rng.gen_range(0..buckets.len())]
    } else {
        let mut pick = rng.gen_range(0..total);
        let mut chosen = buckets[0];
        for (bucket, count) in histogram.iter() {
            if pick < count {
                chosen = bucket;
                break;
            }
            pick -= count;
        }
        chosen
    };

    let room = normalizer.capacity(bucket).saturating_sub(FRAME_HEADER_LEN);
    (bucket, rng.gen_range(0..=room))
}

/// Handle to a running cover-traffic rate
#[derive(Debug, Clone)]
pub struct DummyGenerator {
    rate: watch::Sender<DummyRate>,
}

impl DummyGenerator {
    /// Create a generator at `rate`
    pub fn new(rate: DummyRate) -> Self {
        let (tx, _) = watch::channel(rate);
        Self { rate: tx }
    }

    /// Get the current rate
    pub fn rate(&self) -> DummyRate {
        *self.rate.borrow()
    }

    /// Change the rate; running tickers pick it up immediately
    pub fn set_rate(&self, rate: DummyRate) -> TimingResult<()> {
        rate.validate()?;
        self.rate.send_replace(rate);
        debug!(interval_ms = rate.interval.as_millis() as u64, "Dummy rate changed");
        Ok(())
    }

    /// Subscribe to rate changes
    pub fn subscribe(&self) -> watch::Receiver<DummyRate> {
        self.rate.subscribe()
    }

    /// Run a ticker for `rate`, calling `tick` once per dummy.
    ///
    /// Returns when the generator is dropped or `tick` yields `false`.
    pub async fn run<F, Fut>(mut rate: watch::Receiver<DummyRate>, mut tick: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        loop {
            let current = *rate.borrow_and_update();
            let wait = current.draw_interval(&mut rand::thread_rng());

            match wait {
                None => {
                    if rate.changed().await.is_err() {
                        return;
                    }
                }
                Some(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            if !tick().await {
                                return;
                            }
                        }
                        changed = rate.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
