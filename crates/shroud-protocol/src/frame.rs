//! Inner frames
//!
//! Every datagram carries exactly one frame inside the padded region:
//!
//! ```text
//! +------+----------+----------+--------+
//! | Kind | Seq      | Ack      | Body   |
//! | 1B   | u64 LE   | u64 LE   | ...    |
//! +------+----------+----------+--------+
//! ```
//!
//! All kinds share this shape and the bucket set, so once sealed a dummy
//! looks exactly like application data.

use tokio::time::Instant;

use crate::constants::FRAME_HEADER_LEN;
use crate::errors::{ProtocolError, ProtocolResult};

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Application payload
    Data = 0x01,
    /// Cover traffic, discarded by the receiver
    Dummy = 0x02,
    /// Standalone acknowledgement
    Ack = 0x03,
    /// Hop confirmation probe
    Probe = 0x04,
    /// Session teardown
    Close = 0x05,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameKind::Data),
            0x02 => Some(FrameKind::Dummy),
            0x03 => Some(FrameKind::Ack),
            0x04 => Some(FrameKind::Probe),
            0x05 => Some(FrameKind::Close),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether the frame carries application data
    pub fn is_real(self) -> bool {
        matches!(self, FrameKind::Data)
    }

    /// Control frames are generated by the session itself
    pub fn is_control(self) -> bool {
        matches!(self, FrameKind::Ack | FrameKind::Probe | FrameKind::Close)
    }
}

/// Decoded inner frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Sequence number (0 for anything but data)
    pub seq: u64,
    /// Cumulative acknowledgement
    pub ack: u64,
    /// Body
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame
    pub fn new(kind: FrameKind, seq: u64, ack: u64, body: Vec<u8>) -> Self {
        Self { kind, seq, ack, body }
    }

    /// Encoded length for a body of `body_len` bytes
    pub fn encoded_len(body_len: usize) -> usize {
        FRAME_HEADER_LEN + body_len
    }

    /// Serialize to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::encoded_len(self.body.len()));
        buf.push(self.kind.to_u8());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.ack.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Deserialize from bytes
    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::PacketTooSmall {
                got: data.len(),
                min: FRAME_HEADER_LEN,
            });
        }

        let kind = FrameKind::from_u8(data[0]).ok_or(ProtocolError::UnknownFrameKind(data[0]))?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&data[1..9]);
        let seq = u64::from_le_bytes(word);
        word.copy_from_slice(&data[9..17]);
        let ack = u64::from_le_bytes(word);

        Ok(Self {
            kind,
            seq,
            ack,
            body: data[FRAME_HEADER_LEN..].to_vec(),
        })
    }
}

/// A frame waiting in the transmission queue.
///
/// The bucket is fixed at enqueue time so oversize payloads fail in the
/// caller's hands; the acknowledgement field is stamped at release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Frame kind
    pub kind: FrameKind,
    /// Sequence number (data frames only)
    pub seq: u64,
    /// Body bytes
    pub payload: Vec<u8>,
    /// Body length before padding
    pub true_len: usize,
    /// Bucket (wire size) the frame will occupy
    pub padded_len: usize,
    /// Not released before this instant
    pub earliest_send: Instant,
    /// Discarded instead of sent after this instant (cover traffic only)
    pub deadline: Option<Instant>,
}

impl OutboundFrame {
    /// Create a frame ready now
    pub fn new(
        kind: FrameKind,
        seq: u64,
        payload: Vec<u8>,
        padded_len: usize,
        now: Instant,
    ) -> Self {
        Self {
            kind,
            seq,
            true_len: payload.len(),
            payload,
            padded_len,
            earliest_send: now,
            deadline: None,
        }
    }

    /// Set a deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Check whether the deadline has passed
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |d| now > d)
    }

    /// Build the inner frame with the current cumulative ack
    pub fn to_frame(&self, ack: u64) -> Frame {
        Frame::new(self.kind, self.seq, ack, self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_frame_kind_roundtrip() {
        for kind in [
            FrameKind::Data,
            FrameKind::Dummy,
            FrameKind::Ack,
            FrameKind::Probe,
            FrameKind::Close,
        ] {
            assert_eq!(FrameKind::from_u8(kind.to_u8()), Some(kind));
        }
        assert_eq!(FrameKind::from_u8(0), None);
    }

    #[test]
    fn test_frame_codec() {
        let frame = Frame::new(FrameKind::Data, 42, 41, b"reading".to_vec());
        let bytes = frame.encode();
        assert_eq!(bytes.len(), Frame::encoded_len(7));
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_decode_short() {
        assert!(matches!(
            Frame::decode(&[1u8; 5]),
            Err(ProtocolError::PacketTooSmall { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut bytes = Frame::new(FrameKind::Ack, 0, 3, Vec::new()).encode();
        bytes[0] = 0x99;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(ProtocolError::UnknownFrameKind(0x99))
        ));
    }

    #[test]
    fn test_kind_classes() {
        assert!(FrameKind::Data.is_real());
        assert!(!FrameKind::Dummy.is_real());
        assert!(FrameKind::Probe.is_control());
        assert!(!FrameKind::Dummy.is_control());
    }

    #[test]
    fn test_outbound_deadline() {
        let now = Instant::now();
        let frame = OutboundFrame::new(FrameKind::Dummy, 0, vec![0; 4], 256, now)
            .with_deadline(now + Duration::from_secs(1));
        assert!(!frame.is_expired(now));
        assert!(frame.is_expired(now + Duration::from_secs(2)));
        assert_eq!(frame.to_frame(9).ack, 9);
    }
}
