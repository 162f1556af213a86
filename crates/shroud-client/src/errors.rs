//! Client Errors
//!
//! Error types for the shroud client.

use shroud_protocol::ProtocolError;
use shroud_session::{ConfigError, SessionError};
use thiserror::Error;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// No ServerHello after every attempt
    #[error("Handshake timed out after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },

    /// Invalid server or proxy address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// DNS resolution failed
    #[error("DNS resolution failed for {host}: {reason}")]
    DnsResolutionFailed { host: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session runtime error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Whether the session is still usable after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::Session(e) => e.is_recoverable(),
            _ => false,
        }
    }
}
