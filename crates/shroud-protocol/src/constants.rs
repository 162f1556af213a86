//! Protocol Constants
//!
//! Version numbers, sizes, and protocol parameters.

/// Protocol version (major.minor)
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Default rendezvous port (CoAP over DTLS)
pub const DEFAULT_RENDEZVOUS_PORT: u16 = 5684;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Length prefix the padding normalizer embeds
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Session ID size
pub const SESSION_ID_SIZE: usize = 16;

/// Inner frame header: kind (1) + seq (8) + ack (8)
pub const FRAME_HEADER_LEN: usize = 17;

/// Default padding buckets (total wire bytes)
pub const DEFAULT_BUCKETS: [usize; 4] = [256, 512, 1024, 1400];

/// Handshake message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelloType {
    /// Client hello (handshake initiation)
    ClientHello = 0x01,
    /// Server hello (handshake response)
    ServerHello = 0x02,
}

impl HelloType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(HelloType::ClientHello),
            0x02 => Some(HelloType::ServerHello),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}
