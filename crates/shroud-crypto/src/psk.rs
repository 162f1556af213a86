//! Pre-shared key credentials

use rand::RngCore;

use crate::errors::{CryptoError, CryptoResult};

/// Minimum accepted PSK length in bytes
pub const MIN_PSK_LEN: usize = 16;

/// Size of generated keys (128 bits)
pub const GENERATED_PSK_LEN: usize = 16;

/// Longest identity that fits the hello encoding
pub const MAX_IDENTITY_LEN: usize = 255;

/// A PSK identity and its key
#[derive(Clone, PartialEq, Eq)]
pub struct PskCredentials {
    identity: String,
    key: Vec<u8>,
}

impl PskCredentials {
    /// Create credentials from raw key bytes
    pub fn new(identity: impl Into<String>, key: Vec<u8>) -> CryptoResult<Self> {
        let identity = identity.into();
        if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
            return Err(CryptoError::InvalidPsk(format!(
                "identity must be 1..={} bytes",
                MAX_IDENTITY_LEN
            )));
        }
        if key.len() < MIN_PSK_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: MIN_PSK_LEN,
                got: key.len(),
            });
        }
        Ok(Self { identity, key })
    }

    /// Parse a hex key, with or without a `0x` prefix
    pub fn from_hex(identity: impl Into<String>, key_hex: &str) -> CryptoResult<Self> {
        let trimmed = key_hex.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let key = hex::decode(digits).map_err(|e| CryptoError::InvalidPsk(e.to_string()))?;
        Self::new(identity, key)
    }

    /// Generate fresh credentials named `client-<4 hex digits>`
    pub fn generate() -> CryptoResult<Self> {
        let mut rng = rand::thread_rng();
        let mut tag = [0u8; 2];
        let mut key = vec![0u8; GENERATED_PSK_LEN];
        rng.try_fill_bytes(&mut tag)
            .map_err(|_| CryptoError::RngError)?;
        rng.try_fill_bytes(&mut key)
            .map_err(|_| CryptoError::RngError)?;
        Self::new(format!("client-{}", hex::encode(tag)), key)
    }

    /// Get the identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Get the key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Get the key as lowercase hex
    pub fn key_hex(&self) -> String {
        hex::encode(&self.key)
    }
}

impl std::fmt::Debug for PskCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskCredentials")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
