//! Read-only session views
//!
//! The actor publishes a fresh snapshot through a watch channel after
//! every step, so health checks and metrics never wait on it.

use shroud_protocol::{HopRecord, SessionId, SessionStatus};
use shroud_timing::{BucketHistogram, SchedulerStats};

/// Per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    /// Data frames put on the wire, retransmissions included
    pub data_sent: u64,
    /// Data frames received, duplicates included
    pub data_received: u64,
    /// Payloads handed to the application
    pub delivered: u64,
    /// Duplicate data frames dropped
    pub duplicates: u64,
    /// Data frames queued again after a timeout
    pub retransmits: u64,
    /// Cover frames sent
    pub dummies_sent: u64,
    /// Cover frames received and discarded
    pub dummies_received: u64,
    /// Ack, probe and close frames sent
    pub control_sent: u64,
    /// Data frames held across a handoff and replayed
    pub handoff_replayed: u64,
    /// Datagrams on this session's ports that failed authentication
    pub auth_failures: u64,
    /// Authenticated datagrams that did not parse
    pub malformed: u64,
    /// Sends the socket refused
    pub send_errors: u64,
}

/// Consistent view of one session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Session id
    pub id: SessionId,
    /// Status
    pub status: SessionStatus,
    /// Current (or target) hop index
    pub hop: u64,
    /// Hop state name
    pub hop_state: &'static str,
    /// Local ports the session holds
    pub bound_ports: Vec<u16>,
    /// Frames in the transmission queue
    pub queue_depth: usize,
    /// Data frames in the transmission queue
    pub real_queued: usize,
    /// Data frames held until a handoff settles
    pub handoff_buffered: usize,
    /// Data frames sent but not acknowledged
    pub in_flight: usize,
    /// Buckets used by real traffic
    pub histogram: BucketHistogram,
    /// Counters
    pub counters: SessionCounters,
    /// Scheduler counters
    pub scheduler: SchedulerStats,
    /// Hop history, increasing in hop index
    pub history: Vec<HopRecord>,
}

impl SessionSnapshot {
    /// Snapshot of a session that has not started yet
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            status: SessionStatus::Active,
            hop: 0,
            hop_state: "Bound",
            bound_ports: Vec::new(),
            queue_depth: 0,
            real_queued: 0,
            handoff_buffered: 0,
            in_flight: 0,
            histogram: BucketHistogram::new(),
            counters: SessionCounters::default(),
            scheduler: SchedulerStats::default(),
            history: Vec::new(),
        }
    }

    /// Check if the session holds `port`
    pub fn owns_port(&self, port: u16) -> bool {
        self.bound_ports.contains(&port)
    }
}
