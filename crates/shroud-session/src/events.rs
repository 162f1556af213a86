//! Observability Events
//!
//! Per-hop outcomes, queue depth and bucket usage, delivered to an
//! optional external collector. Delivery never blocks a session: when the
//! collector falls behind, events are dropped.

use std::fmt;

use shroud_protocol::{PortPair, SessionId};
use tokio::sync::mpsc;
use tracing::trace;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local owner
    Local,
    /// Peer sent a close frame
    Remote,
    /// No traffic for the idle timeout
    Idle,
    /// Too many authentication failures
    Failed,
    /// Manager shut down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Local => "local",
            CloseReason::Remote => "remote",
            CloseReason::Idle => "idle",
            CloseReason::Failed => "failed",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Obfuscation layer events
#[derive(Debug, Clone, PartialEq)]
pub enum ObfuscationEvent {
    /// A hop instant was reached
    HopStarted {
        session: SessionId,
        hop: u64,
        old: PortPair,
        new: PortPair,
    },

    /// The peer was seen on the new pair
    HopSucceeded {
        session: SessionId,
        hop: u64,
        pair: PortPair,
    },

    /// A hop probe went unanswered and was re-sent
    HopRetry {
        session: SessionId,
        hop: u64,
        attempt: u32,
    },

    /// Hop confirmation retries exhausted
    HopFailed {
        session: SessionId,
        hop: u64,
        retries: u32,
    },

    /// Session entered the degraded state
    SessionDegraded { session: SessionId, hop: u64 },

    /// Degraded session resynchronized
    SessionRecovered { session: SessionId, hop: u64 },

    /// Session failed and must be re-established
    SessionFailed { session: SessionId, reason: String },

    /// Session torn down
    SessionClosed {
        session: SessionId,
        reason: CloseReason,
    },

    /// Transmission queue depth after an enqueue
    QueueDepth {
        session: SessionId,
        depth: usize,
        real: usize,
    },

    /// A frame left in a bucket
    BucketUsed {
        session: SessionId,
        bucket: usize,
        dummy: bool,
    },

    /// A datagram failed authentication on a session's port
    AuthFailure {
        session: Option<SessionId>,
        local_port: u16,
        consecutive: u32,
    },

    /// A real frame was refused because the queue is full
    Backpressure {
        session: SessionId,
        depth: usize,
        bound: usize,
    },
}

impl ObfuscationEvent {
    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ObfuscationEvent::HopFailed { .. }
                | ObfuscationEvent::SessionDegraded { .. }
                | ObfuscationEvent::SessionFailed { .. }
                | ObfuscationEvent::Backpressure { .. }
        )
    }

    /// Check if this is a hop lifecycle event
    pub fn is_hop_event(&self) -> bool {
        matches!(
            self,
            ObfuscationEvent::HopStarted { .. }
                | ObfuscationEvent::HopSucceeded { .. }
                | ObfuscationEvent::HopRetry { .. }
                | ObfuscationEvent::HopFailed { .. }
        )
    }

    /// Session the event belongs to, if known
    pub fn session(&self) -> Option<SessionId> {
        match self {
            ObfuscationEvent::HopStarted { session, .. }
            | ObfuscationEvent::HopSucceeded { session, .. }
            | ObfuscationEvent::HopRetry { session, .. }
            | ObfuscationEvent::HopFailed { session, .. }
            | ObfuscationEvent::SessionDegraded { session, .. }
            | ObfuscationEvent::SessionRecovered { session, .. }
            | ObfuscationEvent::SessionFailed { session, .. }
            | ObfuscationEvent::SessionClosed { session, .. }
            | ObfuscationEvent::QueueDepth { session, .. }
            | ObfuscationEvent::BucketUsed { session, .. }
            | ObfuscationEvent::Backpressure { session, .. } => Some(*session),
            ObfuscationEvent::AuthFailure { session, .. } => *session,
        }
    }

    /// Get event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ObfuscationEvent::HopStarted { .. } => "HopStarted",
            ObfuscationEvent::HopSucceeded { .. } => "HopSucceeded",
            ObfuscationEvent::HopRetry { .. } => "HopRetry",
            ObfuscationEvent::HopFailed { .. } => "HopFailed",
            ObfuscationEvent::SessionDegraded { .. } => "SessionDegraded",
            ObfuscationEvent::SessionRecovered { .. } => "SessionRecovered",
            ObfuscationEvent::SessionFailed { .. } => "SessionFailed",
            ObfuscationEvent::SessionClosed { .. } => "SessionClosed",
            ObfuscationEvent::QueueDepth { .. } => "QueueDepth",
            ObfuscationEvent::BucketUsed { .. } => "BucketUsed",
            ObfuscationEvent::AuthFailure { .. } => "AuthFailure",
            ObfuscationEvent::Backpressure { .. } => "Backpressure",
        }
    }
}

impl fmt::Display for ObfuscationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObfuscationEvent::HopStarted { session, hop, old, new } => {
                write!(f, "[{}] hop {} started: {} -> {}", session, hop, old, new)
            }
            ObfuscationEvent::HopSucceeded { session, hop, pair } => {
                write!(f, "[{}] hop {} confirmed on {}", session, hop, pair)
            }
            ObfuscationEvent::HopRetry { session, hop, attempt } => {
                write!(f, "[{}] hop {} retry {}", session, hop, attempt)
            }
            ObfuscationEvent::HopFailed { session, hop, retries } => {
                write!(f, "[{}] hop {} failed after {} retries", session, hop, retries)
            }
            ObfuscationEvent::SessionDegraded { session, hop } => {
                write!(f, "[{}] degraded at hop {}", session, hop)
            }
            ObfuscationEvent::SessionRecovered { session, hop } => {
                write!(f, "[{}] recovered at hop {}", session, hop)
            }
            ObfuscationEvent::SessionFailed { session, reason } => {
                write!(f, "[{}] failed: {}", session, reason)
            }
            ObfuscationEvent::SessionClosed { session, reason } => {
                write!(f, "[{}] closed ({})", session, reason)
            }
            ObfuscationEvent::QueueDepth { session, depth, real } => {
                write!(f, "[{}] queue depth {} ({} real)", session, depth, real)
            }
            ObfuscationEvent::BucketUsed { session, bucket, .. } => {
                write!(f, "[{}] bucket {}", session, bucket)
            }
            ObfuscationEvent::AuthFailure {
                session,
                local_port,
                consecutive,
            } => match session {
                Some(id) => write!(
                    f,
                    "[{}] authentication failure on port {} ({} consecutive)",
                    id, local_port, consecutive
                ),
                None => write!(f, "authentication failure on port {}", local_port),
            },
            ObfuscationEvent::Backpressure { session, depth, bound } => {
                write!(f, "[{}] backpressure at {}/{}", session, depth, bound)
            }
        }
    }
}

/// Non-blocking event delivery
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ObfuscationEvent>>,
}

impl EventSink {
    /// Sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Sink delivering to `tx`
    pub fn new(tx: mpsc::Sender<ObfuscationEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Emit an event, dropping it if the collector is full or gone
    pub fn emit(&self, event: ObfuscationEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                trace!(event = e.into_inner().name(), "Dropped obfuscation event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> SessionId {
        SessionId::from_bytes([7u8; 16])
    }

    #[test]
    fn test_event_classification() {
        let failed = ObfuscationEvent::HopFailed {
            session: id(),
            hop: 3,
            retries: 3,
        };
        assert!(failed.is_error());
        assert!(failed.is_hop_event());
        assert_eq!(failed.name(), "HopFailed");
        assert_eq!(failed.session(), Some(id()));

        let auth = ObfuscationEvent::AuthFailure {
            session: None,
            local_port: 20_001,
            consecutive: 1,
        };
        assert!(!auth.is_error());
        assert_eq!(auth.session(), None);
        assert_eq!(auth.to_string(), "authentication failure on port 20001");
    }

    #[test]
    fn test_display() {
        let event = ObfuscationEvent::HopStarted {
            session: id(),
            hop: 1,
            old: PortPair::new(20_000, 20_001),
            new: PortPair::new(30_000, 30_001),
        };
        assert_eq!(
            event.to_string(),
            format!("[{}] hop 1 started: 20000->20001 -> 30000->30001", id())
        );
    }

    #[test]
    fn test_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(tx);
        for hop in 0..3 {
            sink.emit(ObfuscationEvent::SessionDegraded { session: id(), hop });
        }
        assert!(matches!(
            rx.try_recv(),
            Ok(ObfuscationEvent::SessionDegraded { hop: 0, .. })
        ));
        assert!(rx.try_recv().is_err());

        EventSink::disabled().emit(ObfuscationEvent::SessionRecovered { session: id(), hop: 0 });
    }
}
