//! Hop schedule and port derivation
//!
//! Both peers hold the same seed after the handshake, so they can compute
//! every future hop instant and port pair on their own. Nothing about an
//! upcoming hop is ever announced on the wire.

use std::time::Duration;

use shroud_crypto::{Role, SeededDraw, KEY_SIZE};
use tokio::time::Instant;

use crate::errors::{ProtocolError, ProtocolResult};

const LABEL_OFFSET: &[u8] = b"hop-offset";
const LABEL_CLIENT_PORT: &[u8] = b"client-port";
const LABEL_SERVER_PORT: &[u8] = b"server-port";
const PORT_ATTEMPTS: u32 = 8;

/// Smallest port range a schedule accepts
pub const MIN_PORT_SPAN: u32 = 16;

/// Inclusive range of ports hops are drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    /// Create and validate a range
    pub fn new(min: u16, max: u16) -> ProtocolResult<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    /// Number of ports in the range
    pub fn len(&self) -> u32 {
        (self.max as u32 + 1).saturating_sub(self.min as u32)
    }

    /// Check if the range is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if a port lies inside the range
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Validate the range
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.min < 1024 {
            return Err(ProtocolError::InvalidSchedule(
                "port range must start at 1024 or above".into(),
            ));
        }
        if self.len() < MIN_PORT_SPAN {
            return Err(ProtocolError::InvalidSchedule(format!(
                "port range {}..={} holds fewer than {} ports",
                self.min, self.max, MIN_PORT_SPAN
            )));
        }
        Ok(())
    }
}

/// The (client port, server port) a session uses during one hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub client_port: u16,
    pub server_port: u16,
}

impl PortPair {
    /// Create a pair
    pub fn new(client_port: u16, server_port: u16) -> Self {
        Self {
            client_port,
            server_port,
        }
    }

    /// Port this endpoint binds
    pub fn local(&self, role: Role) -> u16 {
        match role {
            Role::Client => self.client_port,
            Role::Server => self.server_port,
        }
    }

    /// Port this endpoint sends to
    pub fn remote(&self, role: Role) -> u16 {
        self.local(role.peer())
    }
}

impl std::fmt::Display for PortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.client_port, self.server_port)
    }
}

/// Hop parameters both peers must agree on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopParameters {
    /// Hopping on or off; when off the session stays on hop 0
    pub enabled: bool,
    /// Mean time between hops
    pub interval: Duration,
    /// Per-hop deviation bound around the mean
    pub jitter: Duration,
    /// Ports hops are drawn from
    pub ports: PortRange,
}

impl HopParameters {
    /// Validate parameters
    pub fn validate(&self) -> ProtocolResult<()> {
        self.ports.validate()?;
        if self.interval.is_zero() {
            return Err(ProtocolError::InvalidSchedule("hop interval cannot be 0".into()));
        }
        if self.jitter * 2 >= self.interval {
            return Err(ProtocolError::InvalidSchedule(format!(
                "hop jitter {:?} must be under half the interval {:?}",
                self.jitter, self.interval
            )));
        }
        Ok(())
    }
}

/// Deterministic schedule of hop instants and port pairs
#[derive(Clone)]
pub struct HopSchedule {
    draw: SeededDraw,
    params: HopParameters,
}

impl HopSchedule {
    /// Create a schedule from the session's hop seed
    pub fn new(seed: &[u8; KEY_SIZE], params: HopParameters) -> ProtocolResult<Self> {
        params.validate()?;
        Ok(Self {
            draw: SeededDraw::new(seed),
            params,
        })
    }

    /// Get the parameters
    pub fn params(&self) -> &HopParameters {
        &self.params
    }

    /// Offset of hop `hop` from its nominal instant, in milliseconds
    pub fn offset_ms(&self, hop: u64) -> i64 {
        let jitter = self.params.jitter.as_millis() as u64;
        if jitter == 0 {
            return 0;
        }
        self.draw.draw_below(LABEL_OFFSET, hop, 0, jitter * 2 + 1) as i64 - jitter as i64
    }

    /// Instant at which hop `hop` begins
    pub fn instant(&self, epoch: Instant, hop: u64) -> Instant {
        if hop == 0 {
            return epoch;
        }
        let nominal = (self.params.interval.as_millis() as u64).saturating_mul(hop);
        let offset = self.offset_ms(hop);
        let at = if offset >= 0 {
            nominal.saturating_add(offset as u64)
        } else {
            nominal.saturating_sub(offset.unsigned_abs())
        };
        epoch + Duration::from_millis(at)
    }

    /// Latest hop whose instant is at or before `now`
    pub fn hop_at(&self, epoch: Instant, now: Instant) -> u64 {
        if now <= epoch {
            return 0;
        }
        let interval = (self.params.interval.as_millis() as u64).max(1);
        let elapsed = now.duration_since(epoch).as_millis() as u64;
        let mut hop = elapsed / interval + 1;
        while hop > 0 && self.instant(epoch, hop) > now {
            hop -= 1;
        }
        hop
    }

    /// Port pair for hop `hop`; client and server ports always differ
    pub fn pair(&self, hop: u64) -> PortPair {
        let ports = self.params.ports;
        let span = ports.len() as u64;
        let pick = |label: &[u8], attempt: u32| {
            ports.min + self.draw.draw_below(label, hop, attempt, span) as u16
        };

        for attempt in 0..PORT_ATTEMPTS {
            let client = pick(LABEL_CLIENT_PORT, attempt);
            let server = pick(LABEL_SERVER_PORT, attempt);
            if client != server {
                return PortPair::new(client, server);
            }
        }

        let client = pick(LABEL_CLIENT_PORT, 0);
        let server = if client < ports.max { client + 1 } else { ports.min };
        PortPair::new(client, server)
    }
}

impl std::fmt::Debug for HopSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopSchedule")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HopParameters {
        HopParameters {
            enabled: true,
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(20),
            ports: PortRange::new(20_000, 60_000).unwrap(),
        }
    }

    #[test]
    fn test_peers_derive_same_pairs() {
        let client = HopSchedule::new(&[42u8; 32], params()).unwrap();
        let server = HopSchedule::new(&[42u8; 32], params()).unwrap();
        for hop in 0..200 {
            assert_eq!(client.pair(hop), server.pair(hop));
            assert_eq!(client.offset_ms(hop), server.offset_ms(hop));
        }
    }

    #[test]
    fn test_pair_idempotent_and_in_range() {
        let schedule = HopSchedule::new(&[7u8; 32], params()).unwrap();
        for hop in 0..500 {
            let pair = schedule.pair(hop);
            assert_eq!(pair, schedule.pair(hop));
            assert_ne!(pair.client_port, pair.server_port);
            assert!(params().ports.contains(pair.client_port));
            assert!(params().ports.contains(pair.server_port));
        }
    }

    #[test]
    fn test_different_seeds_differ() {
        let a = HopSchedule::new(&[1u8; 32], params()).unwrap();
        let b = HopSchedule::new(&[2u8; 32], params()).unwrap();
        let same = (0..50).filter(|&h| a.pair(h) == b.pair(h)).count();
        assert!(same < 3);
    }

    #[test]
    fn test_instants_strictly_increase() {
        let schedule = HopSchedule::new(&[3u8; 32], params()).unwrap();
        let epoch = Instant::now();
        let mut prev = schedule.instant(epoch, 0);
        for hop in 1..300 {
            let at = schedule.instant(epoch, hop);
            assert!(at > prev, "hop {}", hop);
            let offset = schedule.offset_ms(hop);
            assert!(offset.abs() <= 20_000);
            prev = at;
        }
    }

    #[test]
    fn test_hop_at_inverts_instant() {
        let schedule = HopSchedule::new(&[5u8; 32], params()).unwrap();
        let epoch = Instant::now();
        assert_eq!(schedule.hop_at(epoch, epoch), 0);
        for hop in 1..50 {
            let at = schedule.instant(epoch, hop);
            assert_eq!(schedule.hop_at(epoch, at), hop);
            assert_eq!(schedule.hop_at(epoch, at - Duration::from_millis(1)), hop - 1);
        }
    }

    #[test]
    fn test_zero_jitter_is_periodic() {
        let mut p = params();
        p.jitter = Duration::ZERO;
        p.interval = Duration::from_secs(30);
        let schedule = HopSchedule::new(&[9u8; 32], p).unwrap();
        let epoch = Instant::now();
        assert_eq!(schedule.instant(epoch, 1), epoch + Duration::from_secs(30));
        assert_eq!(schedule.instant(epoch, 2), epoch + Duration::from_secs(60));
    }

    #[test]
    fn test_parameter_validation() {
        let mut p = params();
        p.jitter = Duration::from_secs(30);
        assert!(HopSchedule::new(&[0u8; 32], p).is_err());

        assert!(PortRange::new(80, 2000).is_err());
        assert!(PortRange::new(30_000, 30_010).is_err());
        assert!(PortRange::new(30_000, 30_015).is_ok());
    }

    #[test]
    fn test_local_remote() {
        let pair = PortPair::new(21_000, 22_000);
        assert_eq!(pair.local(Role::Client), 21_000);
        assert_eq!(pair.remote(Role::Client), 22_000);
        assert_eq!(pair.local(Role::Server), 22_000);
        assert_eq!(pair.remote(Role::Server), 21_000);
    }
}
