//! Server Errors
//!
//! Error types for the rendezvous server.

use shroud_protocol::ProtocolError;
use shroud_session::{ConfigError, SessionError};
use thiserror::Error;

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// Server is already running
    #[error("Server is already running")]
    AlreadyRunning,

    /// Failed to bind the rendezvous port
    #[error("Failed to bind to {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake or codec error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session runtime error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Datagram on the rendezvous port that is not a ClientHello
    #[error("Unexpected message on rendezvous port")]
    UnexpectedMessage,

    /// Session limit reached
    #[error("Maximum sessions ({max}) reached")]
    SessionLimitReached { max: usize },
}
