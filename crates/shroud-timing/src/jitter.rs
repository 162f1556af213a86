//! Jitter policies
//!
//! How long a frame waits before it leaves, and how far apart fixed
//! transmission slots are.

use std::time::Duration;

use rand::Rng;

use crate::errors::{TimingError, TimingResult};

/// Longest delay a policy may impose on a single frame
pub const MAX_POLICY_DELAY: Duration = Duration::from_secs(60);

/// Shape of randomized delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayDistribution {
    /// Uniform over `[min, max]`
    Uniform,
    /// Exponential truncated to `[min, max]`; most frames leave early
    Exponential,
}

/// Scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterMode {
    /// Every frame is held for an independent random delay
    RandomizedDelay {
        min: Duration,
        max: Duration,
        distribution: DelayDistribution,
    },
    /// One slot every `base ± jitter`; at most one frame per slot
    FixedInterval { base: Duration, jitter: Duration },
}

/// Immutable timing configuration read by the scheduler and the
/// cover-traffic generator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterPolicy {
    /// Scheduling mode
    pub mode: JitterMode,
    /// Chance a frame is promoted to a larger bucket than it needs
    pub padding_probability: f64,
}

impl JitterPolicy {
    /// Uniform randomized delays between `min` and `max`
    pub fn randomized(min: Duration, max: Duration) -> Self {
        Self {
            mode: JitterMode::RandomizedDelay {
                min,
                max,
                distribution: DelayDistribution::Uniform,
            },
            padding_probability: 0.0,
        }
    }

    /// Fixed slots every `base ± jitter`
    pub fn fixed(base: Duration, jitter: Duration) -> Self {
        Self {
            mode: JitterMode::FixedInterval { base, jitter },
            padding_probability: 0.0,
        }
    }

    /// Set the bucket promotion probability
    pub fn with_padding_probability(mut self, probability: f64) -> Self {
        self.padding_probability = probability;
        self
    }

    /// Check if this is fixed-interval mode
    pub fn is_fixed_interval(&self) -> bool {
        matches!(self.mode, JitterMode::FixedInterval { .. })
    }

    /// Validate the policy
    pub fn validate(&self) -> TimingResult<()> {
        if !(0.0..=1.0).contains(&self.padding_probability) {
            return Err(TimingError::InvalidConfig(format!(
                "padding probability {} outside [0, 1]",
                self.padding_probability
            )));
        }
        match self.mode {
            JitterMode::RandomizedDelay { min, max, .. } => {
                if min > max {
                    return Err(TimingError::InvalidConfig(format!(
                        "min delay {:?} exceeds max delay {:?}",
                        min, max
                    )));
                }
                if max > MAX_POLICY_DELAY {
                    return Err(TimingError::InvalidConfig(format!(
                        "max delay {:?} exceeds {:?}",
                        max, MAX_POLICY_DELAY
                    )));
                }
            }
            JitterMode::FixedInterval { base, jitter } => {
                if base.is_zero() {
                    return Err(TimingError::InvalidConfig("fixed interval cannot be 0".into()));
                }
                if jitter >= base {
                    return Err(TimingError::InvalidConfig(format!(
                        "interval jitter {:?} must be below the interval {:?}",
                        jitter, base
                    )));
                }
                if base > MAX_POLICY_DELAY {
                    return Err(TimingError::InvalidConfig(format!(
                        "fixed interval {:?} exceeds {:?}",
                        base, MAX_POLICY_DELAY
                    )));
                }
            }
        }
        Ok(())
    }

    /// Draw the hold time for one frame (randomized) or the gap to the
    /// next slot (fixed interval)
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match self.mode {
            JitterMode::RandomizedDelay {
                min,
                max,
                distribution,
            } => sample_delay(min, max, distribution, rng),
            JitterMode::FixedInterval { base, jitter } => sample_interval(base, jitter, rng),
        }
    }
}

impl Default for JitterPolicy {
    fn default() -> Self {
        Self::randomized(Duration::from_millis(50), Duration::from_millis(500))
    }
}

/// Draw a delay in `[min, max]`
pub fn sample_delay<R: Rng + ?Sized>(
    min: Duration,
    max: Duration,
    distribution: DelayDistribution,
    rng: &mut R,
) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_secs_f64();
    let offset = match distribution {
        DelayDistribution::Uniform => rng.gen_range(0.0..=span),
        DelayDistribution::Exponential => {
            // Inverse CDF of an exponential truncated at `span`, mean span/3
            let lambda = 3.0 / span;
            let u: f64 = rng.gen_range(0.0..1.0);
            -(1.0 - u * (1.0 - (-lambda * span).exp())).ln() / lambda
        }
    };
    min + Duration::from_secs_f64(offset.clamp(0.0, span))
}

/// Draw `base ± jitter`
pub fn sample_interval<R: Rng + ?Sized>(base: Duration, jitter: Duration, rng: &mut R) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let j = jitter.as_secs_f64();
    let offset = rng.gen_range(-j..=j);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

/// Exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff doubling from `base` up to `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempts: 0,
        }
    }

    /// Delay for the current attempt without advancing
    pub fn current_delay(&self) -> Duration {
        let factor = 1u32 << self.attempts.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Get next backoff delay and advance
    pub fn backoff(&mut self) -> Duration {
        let delay = self.current_delay();
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Reset backoff
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Get attempt count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Check if at max backoff
    pub fn is_maxed(&self) -> bool {
        self.current_delay() >= self.max
    }
}
