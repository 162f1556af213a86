//! Session Errors
//!
//! Error types surfaced to the owner of a session.

use shroud_crypto::CryptoError;
use shroud_protocol::ProtocolError;
use shroud_timing::TimingError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Payload does not fit the largest bucket
    #[error("Payload of {len} bytes exceeds the largest bucket capacity ({max} bytes)")]
    Oversize { len: usize, max: usize },

    /// Datagram failed authentication
    #[error("Datagram failed authentication")]
    AuthFailure,

    /// Hop confirmation retries exhausted
    #[error("Hop {hop} not confirmed after {retries} retries")]
    HopTimeout { hop: u64, retries: u32 },

    /// Transmission queue is full of real frames
    #[error("Transmission queue full ({depth}/{bound} frames)")]
    Backpressure { depth: usize, bound: usize },

    /// Session already torn down
    #[error("Session is closed")]
    SessionClosed,

    /// No such session
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A live session already uses this id
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// Failed to bind a local port
    #[error("Failed to bind port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    /// Proxy negotiation failed
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    /// Timing error
    #[error("Timing error: {0}")]
    Timing(TimingError),

    /// Internal channel closed
    #[error("Internal channel closed")]
    ChannelClosed,
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Oversize { len, max } => SessionError::Oversize { len, max },
            ProtocolError::CryptoError(c) => c.into(),
            other => SessionError::Protocol(other),
        }
    }
}

impl From<CryptoError> for SessionError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthFailure => SessionError::AuthFailure,
            other => SessionError::Crypto(other),
        }
    }
}

impl From<TimingError> for SessionError {
    fn from(e: TimingError) -> Self {
        match e {
            TimingError::Backpressure { depth, bound } => {
                SessionError::Backpressure { depth, bound }
            }
            TimingError::SchedulerStopped | TimingError::ChannelClosed => {
                SessionError::SessionClosed
            }
            other => SessionError::Timing(other),
        }
    }
}

impl SessionError {
    /// Whether the caller can retry the same operation later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::Backpressure { .. }
                | SessionError::HopTimeout { .. }
                | SessionError::AuthFailure
        )
    }
}
