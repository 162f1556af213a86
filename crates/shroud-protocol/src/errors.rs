//! Protocol Error Types

use thiserror::Error;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Payload does not fit the largest padding bucket
    #[error("Payload of {len} bytes exceeds largest bucket capacity of {max} bytes")]
    Oversize { len: usize, max: usize },

    /// Bucket list rejected
    #[error("Invalid bucket set: {0}")]
    InvalidBuckets(String),

    /// Bucket not part of the configured set
    #[error("Bucket {0} is not configured")]
    UnknownBucket(usize),

    /// Invalid frame format
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Packet too small
    #[error("Packet too small: got {got} bytes, need at least {min}")]
    PacketTooSmall { got: usize, min: usize },

    /// Unknown frame kind byte
    #[error("Unknown frame kind: 0x{0:02x}")]
    UnknownFrameKind(u8),

    /// Handshake error
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// PSK identity not known to this endpoint
    #[error("Unknown PSK identity: {0}")]
    UnknownIdentity(String),

    /// Protocol version mismatch
    #[error("Version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },

    /// Invalid hop schedule parameters
    #[error("Invalid hop schedule: {0}")]
    InvalidSchedule(String),

    /// Crypto error from shroud-crypto
    #[error("Crypto error: {0}")]
    CryptoError(#[from] shroud_crypto::CryptoError),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
