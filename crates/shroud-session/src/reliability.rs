//! Exactly-once, in-order delivery of real frames
//!
//! Data frames carry a sequence number starting at 1; every frame carries
//! the cumulative acknowledgement of the sender. The send side keeps what
//! the peer has not acknowledged and hands it back for retransmission
//! after a timeout that doubles per attempt. The receive side drops
//! duplicates and holds out-of-order frames until the gap fills.

use std::collections::BTreeMap;
use std::time::Duration;

use shroud_timing::Backoff;
use tokio::time::Instant;

/// Out-of-order frames held before the receiver starts dropping
pub const MAX_REORDER_WINDOW: u64 = 4096;

/// Retransmission timeout ceiling relative to the initial timeout
const MAX_RTO_FACTOR: u32 = 16;

#[derive(Debug, Clone)]
struct Unacked {
    payload: Vec<u8>,
    bucket: usize,
    backoff: Backoff,
    /// `None` while queued and not yet on the wire
    due: Option<Instant>,
}

/// A data frame due for retransmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retransmit {
    pub seq: u64,
    pub payload: Vec<u8>,
    pub bucket: usize,
    pub attempt: u32,
}

/// Sender half
#[derive(Debug)]
pub struct SendWindow {
    next_seq: u64,
    rto: Duration,
    unacked: BTreeMap<u64, Unacked>,
}

impl SendWindow {
    /// Create a window with initial retransmission timeout `rto`
    pub fn new(rto: Duration) -> Self {
        Self {
            next_seq: 1,
            rto,
            unacked: BTreeMap::new(),
        }
    }

    /// Sequence number the next data frame will get
    pub fn peek_seq(&self) -> u64 {
        self.next_seq
    }

    /// Track a queued data frame and return its sequence number
    pub fn track(&mut self, payload: Vec<u8>, bucket: usize) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.unacked.insert(
            seq,
            Unacked {
                payload,
                bucket,
                backoff: Backoff::new(self.rto, self.rto * MAX_RTO_FACTOR),
                due: None,
            },
        );
        seq
    }

    /// A data frame went on the wire; start its timer
    pub fn on_sent(&mut self, seq: u64, now: Instant) {
        if let Some(entry) = self.unacked.get_mut(&seq) {
            if entry.due.is_none() {
                entry.due = Some(now + entry.backoff.backoff());
            }
        }
    }

    /// Apply a cumulative acknowledgement; returns frames newly acknowledged
    pub fn on_ack(&mut self, cumulative: u64) -> usize {
        let before = self.unacked.len();
        self.unacked = self.unacked.split_off(&cumulative.saturating_add(1));
        before - self.unacked.len()
    }

    /// Frames whose timer has expired. Their timers stop until they are
    /// sent again.
    pub fn due(&mut self, now: Instant) -> Vec<Retransmit> {
        self.unacked
            .iter_mut()
            .filter(|(_, entry)| entry.due.map_or(false, |at| at <= now))
            .map(|(seq, entry)| {
                entry.due = None;
                Retransmit {
                    seq: *seq,
                    payload: entry.payload.clone(),
                    bucket: entry.bucket,
                    attempt: entry.backoff.attempts(),
                }
            })
            .collect()
    }

    /// Earliest retransmission timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.unacked.values().filter_map(|entry| entry.due).min()
    }

    /// Unacknowledged data frames
    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }
}

/// What the receiver did with a data frame
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Accepted {
    /// Payloads now deliverable, in order
    pub deliver: Vec<Vec<u8>>,
    /// Frame was already delivered or buffered
    pub duplicate: bool,
}

/// Receiver half
#[derive(Debug, Default)]
pub struct ReceiveWindow {
    delivered: u64,
    pending: BTreeMap<u64, Vec<u8>>,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence delivered in order; this is the cumulative ack
    pub fn cumulative_ack(&self) -> u64 {
        self.delivered
    }

    /// Frames held waiting for a gap to fill
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Accept data frame `seq`
    pub fn on_data(&mut self, seq: u64, payload: Vec<u8>) -> Accepted {
        if seq <= self.delivered || self.pending.contains_key(&seq) {
            return Accepted {
                deliver: Vec::new(),
                duplicate: true,
            };
        }
        if seq > self.delivered + MAX_REORDER_WINDOW {
            // The sender retransmits it once the window has moved
            return Accepted::default();
        }

        self.pending.insert(seq, payload);
        let mut deliver = Vec::new();
        while let Some(payload) = self.pending.remove(&(self.delivered + 1)) {
            self.delivered += 1;
            deliver.push(payload);
        }
        Accepted {
            deliver,
            duplicate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_retransmit_backoff() {
        let start = Instant::now();
        let mut window = SendWindow::new(ms(1000));
        let seq = window.track(b"a".to_vec(), 256);
        assert_eq!(seq, 1);
        assert_eq!(window.peek_seq(), 2);

        // Not on the wire yet: no timer
        assert!(window.next_deadline().is_none());
        window.on_sent(seq, start);
        assert_eq!(window.next_deadline(), Some(start + ms(1000)));

        assert!(window.due(start + ms(999)).is_empty());
        let due = window.due(start + ms(1000));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt, 1);
        assert!(window.next_deadline().is_none());

        // Second transmission waits twice as long
        window.on_sent(seq, start + ms(1200));
        assert_eq!(window.next_deadline(), Some(start + ms(3200)));
    }

    #[test]
    fn test_cumulative_ack() {
        let now = Instant::now();
        let mut window = SendWindow::new(ms(500));
        for i in 0..5u8 {
            let seq = window.track(vec![i], 256);
            window.on_sent(seq, now);
        }
        assert_eq!(window.on_ack(3), 3);
        assert_eq!(window.in_flight(), 2);
        assert_eq!(window.on_ack(2), 0);
        let due = window.due(now + ms(500));
        assert_eq!(due.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_reorder_and_dedup() {
        let mut window = ReceiveWindow::new();
        assert!(window.on_data(2, b"two".to_vec()).deliver.is_empty());
        assert_eq!(window.buffered(), 1);
        assert!(window.on_data(2, b"two".to_vec()).duplicate);

        let accepted = window.on_data(1, b"one".to_vec());
        assert_eq!(accepted.deliver, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(window.cumulative_ack(), 2);

        assert!(window.on_data(1, b"one".to_vec()).duplicate);
        assert_eq!(window.on_data(3, b"three".to_vec()).deliver.len(), 1);
    }

    #[test]
    fn test_far_future_frame_ignored() {
        let mut window = ReceiveWindow::new();
        let accepted = window.on_data(MAX_REORDER_WINDOW + 5, vec![0]);
        assert!(accepted.deliver.is_empty());
        assert!(!accepted.duplicate);
        assert_eq!(window.buffered(), 0);
    }
}
