//! Error types for shroud-crypto

use thiserror::Error;

/// Errors that can occur in shroud-crypto operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    /// Datagram failed authentication (tampered, truncated, or wrong key)
    #[error("Authentication failed")]
    AuthFailure,

    /// Invalid key length
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KdfError(String),

    /// Random number generation failed
    #[error("Random number generation failed")]
    RngError,

    /// Malformed pre-shared key material
    #[error("Invalid pre-shared key: {0}")]
    InvalidPsk(String),
}

/// Result type for shroud-crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
