//! Session identity and status

use rand::RngCore;

use crate::constants::SESSION_ID_SIZE;
use crate::errors::{ProtocolError, ProtocolResult};

/// Opaque session identifier agreed at handshake time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Generate a random session ID
    pub fn generate() -> Self {
        let mut id = [0u8; SESSION_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }

    /// Create from slice
    pub fn from_slice(slice: &[u8]) -> ProtocolResult<Self> {
        if slice.len() != SESSION_ID_SIZE {
            return Err(ProtocolError::InvalidFrame(format!(
                "Invalid session ID length: {} (expected {})",
                slice.len(),
                SESSION_ID_SIZE
            )));
        }
        let mut id = [0u8; SESSION_ID_SIZE];
        id.copy_from_slice(slice);
        Ok(Self(id))
    }

    /// Full hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4])) // Show first 4 bytes
    }
}

/// Session health as seen by the owning application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Traffic flowing on a confirmed port pair
    Active,
    /// Hop confirmation exhausted its retries; still probing
    Degraded,
    /// Persistent authentication failures; needs re-establishment
    Failed,
    /// Torn down
    Closed,
}

impl SessionStatus {
    /// Whether the session can still carry traffic
    pub fn is_usable(self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Degraded)
    }

    /// Get status name for logging
    pub fn name(self) -> &'static str {
        match self {
            SessionStatus::Active => "Active",
            SessionStatus::Degraded => "Degraded",
            SessionStatus::Failed => "Failed",
            SessionStatus::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        let id = SessionId::from_bytes([0xAB; SESSION_ID_SIZE]);
        assert_eq!(id.to_string(), "abababab");
        assert_eq!(id.to_hex().len(), SESSION_ID_SIZE * 2);
    }

    #[test]
    fn test_session_id_from_slice() {
        let id = SessionId::generate();
        assert_eq!(SessionId::from_slice(id.as_bytes()).unwrap(), id);
        assert!(SessionId::from_slice(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_status_usable() {
        assert!(SessionStatus::Active.is_usable());
        assert!(SessionStatus::Degraded.is_usable());
        assert!(!SessionStatus::Failed.is_usable());
        assert!(!SessionStatus::Closed.is_usable());
    }
}
