//! Session Configuration
//!
//! One flat structure holding every obfuscation knob. Invalid values fail
//! fast when a manager is built.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shroud_crypto::SEAL_OVERHEAD;
use shroud_protocol::{
    HopParameters, HopTiming, PaddingNormalizer, PortRange, DEFAULT_BUCKETS, FRAME_HEADER_LEN,
    LENGTH_PREFIX_LEN, MAX_DATAGRAM_SIZE, MIN_PORT_SPAN,
};
use shroud_timing::{
    DelayDistribution, DummyRate, JitterMode, JitterPolicy, MAX_POLICY_DELAY, MIN_DUMMY_INTERVAL,
};

/// Scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterModeKind {
    Randomized,
    Fixed,
}

/// Randomized delay shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayDistributionKind {
    Uniform,
    Exponential,
}

/// Obfuscation configuration for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Allowed wire sizes, strictly increasing
    pub buckets: Vec<usize>,

    /// Chance a frame is promoted to a random larger bucket
    pub padding_probability: f64,

    /// Scheduling mode
    pub jitter_mode: JitterModeKind,

    /// Randomized delay distribution
    pub delay_distribution: DelayDistributionKind,

    /// Randomized delay lower bound (milliseconds)
    pub min_delay_ms: u64,

    /// Randomized delay upper bound (milliseconds)
    pub max_delay_ms: u64,

    /// Fixed slot interval (milliseconds)
    pub fixed_interval_ms: u64,

    /// Fixed slot jitter (milliseconds)
    pub interval_jitter_ms: u64,

    /// Mean gap between dummies (milliseconds, 0 disables)
    pub dummy_interval_ms: u64,

    /// Dummy gap jitter (milliseconds)
    pub dummy_jitter_ms: u64,

    /// One cover ticker for all sessions instead of one per session
    pub shared_dummy_generator: bool,

    /// Rotate port pairs
    pub hopping_enabled: bool,

    /// Mean time between hops (seconds)
    pub hop_interval_secs: u64,

    /// Hop instant jitter (seconds)
    pub hop_jitter_secs: u64,

    /// Minimum dual-liveness after a hop instant (milliseconds)
    pub overlap_window_ms: u64,

    /// Old pair lifetime after confirmation (milliseconds)
    pub grace_period_ms: u64,

    /// Wait for confirmation before re-probing (milliseconds)
    pub hop_timeout_ms: u64,

    /// Probe retries before a session is degraded
    pub max_hop_retries: u32,

    /// Tear down after this long without traffic (seconds)
    pub idle_timeout_secs: u64,

    /// Maximum queued data and dummy frames
    pub queue_bound: usize,

    /// Inclusive port range hops draw from
    pub port_range: [u16; 2],

    /// Consecutive authentication failures before a session fails
    pub auth_failure_threshold: u32,

    /// Initial retransmission timeout (milliseconds)
    pub retransmit_timeout_ms: u64,

    /// Longest an acknowledgement waits for a frame to ride on (milliseconds)
    pub ack_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS.to_vec(),
            padding_probability: 0.0,
            jitter_mode: JitterModeKind::Randomized,
            delay_distribution: DelayDistributionKind::Uniform,
            min_delay_ms: 50,
            max_delay_ms: 500,
            fixed_interval_ms: 200,
            interval_jitter_ms: 50,
            dummy_interval_ms: 2000,
            dummy_jitter_ms: 1000,
            shared_dummy_generator: false,
            hopping_enabled: true,
            hop_interval_secs: 60,
            hop_jitter_secs: 20,
            overlap_window_ms: 5000,
            grace_period_ms: 2000,
            hop_timeout_ms: 2000,
            max_hop_retries: 3,
            idle_timeout_secs: 120,
            queue_bound: 256,
            port_range: [20_000, 60_000],
            auth_failure_threshold: 64,
            retransmit_timeout_ms: 1500,
            ack_delay_ms: 100,
        }
    }
}

impl SessionConfig {
    /// Create a new configuration builder
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let floor = SEAL_OVERHEAD + LENGTH_PREFIX_LEN + FRAME_HEADER_LEN;
        match self.buckets.first() {
            None => return Err(ConfigError::InvalidValue("buckets cannot be empty".into())),
            Some(&smallest) if smallest <= floor => {
                return Err(ConfigError::InvalidValue(format!(
                    "smallest bucket must exceed {} bytes of framing",
                    floor
                )));
            }
            Some(_) => {}
        }
        if !self.buckets.windows(2).all(|w| w[0] < w[1]) {
            return Err(ConfigError::InvalidValue(
                "buckets must be strictly increasing".into(),
            ));
        }
        if self.buckets.iter().any(|&b| b > MAX_DATAGRAM_SIZE) {
            return Err(ConfigError::InvalidValue(format!(
                "buckets cannot exceed {} bytes",
                MAX_DATAGRAM_SIZE
            )));
        }

        if !(0.0..=1.0).contains(&self.padding_probability) {
            return Err(ConfigError::InvalidValue(
                "padding_probability must be within [0, 1]".into(),
            ));
        }

        if self.min_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidValue(
                "min_delay_ms cannot exceed max_delay_ms".into(),
            ));
        }
        if Duration::from_millis(self.max_delay_ms) > MAX_POLICY_DELAY {
            return Err(ConfigError::InvalidValue(format!(
                "max_delay_ms cannot exceed {}",
                MAX_POLICY_DELAY.as_millis()
            )));
        }

        if self.fixed_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("fixed_interval_ms cannot be 0".into()));
        }
        if self.interval_jitter_ms >= self.fixed_interval_ms {
            return Err(ConfigError::InvalidValue(
                "interval_jitter_ms must be below fixed_interval_ms".into(),
            ));
        }

        if self.dummy_interval_ms != 0 {
            if Duration::from_millis(self.dummy_interval_ms) < MIN_DUMMY_INTERVAL {
                return Err(ConfigError::InvalidValue(format!(
                    "dummy_interval_ms must be 0 or at least {}",
                    MIN_DUMMY_INTERVAL.as_millis()
                )));
            }
            if self.dummy_jitter_ms >= self.dummy_interval_ms {
                return Err(ConfigError::InvalidValue(
                    "dummy_jitter_ms must be below dummy_interval_ms".into(),
                ));
            }
        }

        if self.hop_interval_secs < 5 {
            return Err(ConfigError::InvalidValue(
                "hop_interval_secs must be at least 5".into(),
            ));
        }
        if self.hop_jitter_secs * 2 >= self.hop_interval_secs {
            return Err(ConfigError::InvalidValue(
                "hop_jitter_secs must be under half of hop_interval_secs".into(),
            ));
        }
        if self.overlap_window_ms >= self.hop_interval_secs * 1000 {
            return Err(ConfigError::InvalidValue(
                "overlap_window_ms must be shorter than the hop interval".into(),
            ));
        }
        if self.grace_period_ms > self.overlap_window_ms {
            return Err(ConfigError::InvalidValue(
                "grace_period_ms cannot exceed overlap_window_ms".into(),
            ));
        }
        if self.hop_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("hop_timeout_ms cannot be 0".into()));
        }
        if self.max_hop_retries == 0 {
            return Err(ConfigError::InvalidValue("max_hop_retries cannot be 0".into()));
        }

        let [min, max] = self.port_range;
        if min < 1024 || max < min || u32::from(max - min) + 1 < MIN_PORT_SPAN {
            return Err(ConfigError::InvalidValue(format!(
                "port_range must be at least {} ports starting at 1024 or above",
                MIN_PORT_SPAN
            )));
        }

        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("idle_timeout_secs cannot be 0".into()));
        }
        if self.queue_bound == 0 {
            return Err(ConfigError::InvalidValue("queue_bound cannot be 0".into()));
        }
        if self.auth_failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "auth_failure_threshold cannot be 0".into(),
            ));
        }
        if self.retransmit_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "retransmit_timeout_ms cannot be 0".into(),
            ));
        }

        Ok(())
    }

    /// Get the jitter policy
    pub fn jitter_policy(&self) -> JitterPolicy {
        let mode = match self.jitter_mode {
            JitterModeKind::Randomized => JitterMode::RandomizedDelay {
                min: Duration::from_millis(self.min_delay_ms),
                max: Duration::from_millis(self.max_delay_ms),
                distribution: match self.delay_distribution {
                    DelayDistributionKind::Uniform => DelayDistribution::Uniform,
                    DelayDistributionKind::Exponential => DelayDistribution::Exponential,
                },
            },
            JitterModeKind::Fixed => JitterMode::FixedInterval {
                base: Duration::from_millis(self.fixed_interval_ms),
                jitter: Duration::from_millis(self.interval_jitter_ms),
            },
        };
        JitterPolicy {
            mode,
            padding_probability: self.padding_probability,
        }
    }

    /// Get the initial cover traffic rate
    pub fn dummy_rate(&self) -> DummyRate {
        if self.dummy_interval_ms == 0 {
            return DummyRate::disabled();
        }
        DummyRate::every(
            Duration::from_millis(self.dummy_interval_ms),
            Duration::from_millis(self.dummy_jitter_ms),
        )
    }

    /// Get the hop parameters a server dictates at handshake
    pub fn hop_parameters(&self) -> Result<HopParameters, ConfigError> {
        let [min, max] = self.port_range;
        let ports =
            PortRange::new(min, max).map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        Ok(HopParameters {
            enabled: self.hopping_enabled,
            interval: Duration::from_secs(self.hop_interval_secs),
            jitter: Duration::from_secs(self.hop_jitter_secs),
            ports,
        })
    }

    /// Get the handoff timing
    pub fn hop_timing(&self) -> HopTiming {
        HopTiming {
            overlap: Duration::from_millis(self.overlap_window_ms),
            grace: Duration::from_millis(self.grace_period_ms),
            hop_timeout: Duration::from_millis(self.hop_timeout_ms),
            max_retries: self.max_hop_retries,
            max_probe_interval: Duration::from_secs(self.hop_interval_secs) / 2,
        }
    }

    /// Build the padding normalizer for a channel adding `overhead` bytes
    pub fn normalizer(&self, overhead: usize) -> Result<PaddingNormalizer, ConfigError> {
        PaddingNormalizer::new(&self.buckets, overhead)
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))
    }

    /// Get idle timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get initial retransmission timeout
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }

    /// Get acknowledgement delay
    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms)
    }
}

/// Configuration builder
#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Set padding buckets
    pub fn buckets(mut self, buckets: impl Into<Vec<usize>>) -> Self {
        self.config.buckets = buckets.into();
        self
    }

    /// Set bucket promotion probability
    pub fn padding_probability(mut self, probability: f64) -> Self {
        self.config.padding_probability = probability;
        self
    }

    /// Use randomized delays
    pub fn randomized(
        mut self,
        min_ms: u64,
        max_ms: u64,
        distribution: DelayDistributionKind,
    ) -> Self {
        self.config.jitter_mode = JitterModeKind::Randomized;
        self.config.min_delay_ms = min_ms;
        self.config.max_delay_ms = max_ms;
        self.config.delay_distribution = distribution;
        self
    }

    /// Use fixed-interval slots
    pub fn fixed_interval(mut self, interval_ms: u64, jitter_ms: u64) -> Self {
        self.config.jitter_mode = JitterModeKind::Fixed;
        self.config.fixed_interval_ms = interval_ms;
        self.config.interval_jitter_ms = jitter_ms;
        self
    }

    /// Set cover traffic rate (0 disables)
    pub fn dummy_rate(mut self, interval_ms: u64, jitter_ms: u64) -> Self {
        self.config.dummy_interval_ms = interval_ms;
        self.config.dummy_jitter_ms = jitter_ms;
        self
    }

    /// Drive every session's cover traffic from one ticker
    pub fn shared_dummy_generator(mut self, shared: bool) -> Self {
        self.config.shared_dummy_generator = shared;
        self
    }

    /// Enable/disable port hopping
    pub fn hopping(mut self, enabled: bool) -> Self {
        self.config.hopping_enabled = enabled;
        self
    }

    /// Set hop interval and jitter
    pub fn hop_interval(mut self, interval_secs: u64, jitter_secs: u64) -> Self {
        self.config.hop_interval_secs = interval_secs;
        self.config.hop_jitter_secs = jitter_secs;
        self
    }

    /// Set overlap window and grace period
    pub fn overlap(mut self, overlap_ms: u64, grace_ms: u64) -> Self {
        self.config.overlap_window_ms = overlap_ms;
        self.config.grace_period_ms = grace_ms;
        self
    }

    /// Set hop confirmation timeout and retry budget
    pub fn hop_retries(mut self, timeout_ms: u64, max_retries: u32) -> Self {
        self.config.hop_timeout_ms = timeout_ms;
        self.config.max_hop_retries = max_retries;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, secs: u64) -> Self {
        self.config.idle_timeout_secs = secs;
        self
    }

    /// Set queue bound
    pub fn queue_bound(mut self, bound: usize) -> Self {
        self.config.queue_bound = bound;
        self
    }

    /// Set hop port range
    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.config.port_range = [min, max];
        self
    }

    /// Set authentication failure threshold
    pub fn auth_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.auth_failure_threshold = threshold;
        self
    }

    /// Set initial retransmission timeout
    pub fn retransmit_timeout(mut self, ms: u64) -> Self {
        self.config.retransmit_timeout_ms = ms;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.buckets, vec![256, 512, 1024, 1400]);
        assert!(config.validate().is_ok());
        assert!(config.dummy_rate().is_enabled());
        assert!(!config.jitter_policy().is_fixed_interval());
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::builder()
            .buckets(vec![256, 512, 1024])
            .fixed_interval(100, 20)
            .dummy_rate(0, 0)
            .hop_interval(30, 0)
            .build()
            .unwrap();

        assert!(config.jitter_policy().is_fixed_interval());
        assert!(!config.dummy_rate().is_enabled());
        let params = config.hop_parameters().unwrap();
        assert_eq!(params.interval, Duration::from_secs(30));
        assert_eq!(params.jitter, Duration::ZERO);
        assert_eq!(config.normalizer(SEAL_OVERHEAD).unwrap().buckets(), &[256, 512, 1024]);
    }

    #[test]
    fn test_config_validation() {
        let bad = [
            SessionConfig::builder().buckets(Vec::new()).build(),
            SessionConfig::builder().buckets(vec![512, 256]).build(),
            SessionConfig::builder().buckets(vec![40, 512]).build(),
            SessionConfig::builder().padding_probability(1.2).build(),
            SessionConfig::builder()
                .randomized(600, 500, DelayDistributionKind::Uniform)
                .build(),
            SessionConfig::builder().fixed_interval(100, 100).build(),
            SessionConfig::builder().dummy_rate(5, 0).build(),
            SessionConfig::builder().dummy_rate(100, 200).build(),
            SessionConfig::builder().hop_interval(4, 0).build(),
            SessionConfig::builder().hop_interval(30, 15).build(),
            SessionConfig::builder().overlap(1000, 2000).build(),
            SessionConfig::builder().hop_retries(0, 3).build(),
            SessionConfig::builder().hop_retries(1000, 0).build(),
            SessionConfig::builder().port_range(80, 90).build(),
            SessionConfig::builder().port_range(20_000, 20_010).build(),
            SessionConfig::builder().queue_bound(0).build(),
            SessionConfig::builder().auth_failure_threshold(0).build(),
        ];
        for (i, result) in bad.iter().enumerate() {
            assert!(result.is_err(), "case {} should be rejected", i);
        }
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = SessionConfig::builder()
            .randomized(10, 200, DelayDistributionKind::Exponential)
            .build()
            .unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("jitter_mode = \"randomized\""));
        assert!(text.contains("delay_distribution = \"exponential\""));

        let parsed: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);

        // Missing fields fall back to defaults
        let partial: SessionConfig = toml::from_str("queue_bound = 32\n").unwrap();
        assert_eq!(partial.queue_bound, 32);
        assert_eq!(partial.hop_interval_secs, 60);
        assert!(!partial.shared_dummy_generator);
    }
}
