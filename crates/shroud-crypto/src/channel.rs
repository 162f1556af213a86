//! Secure datagram channel
//!
//! The record layer the obfuscation core sits on. The core only needs
//! three things from it: how many bytes sealing adds, `seal` and `open`.

use crate::encryption::{RecordCipher, SEAL_OVERHEAD};
use crate::errors::CryptoResult;
use crate::kdf::SessionKeys;

/// Which end of a session this endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiated the handshake
    Client,
    /// Answered the handshake
    Server,
}

impl Role {
    /// The other end
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Datagram sealing as seen by the obfuscation layer
pub trait SecureDatagram: Send + Sync {
    /// Bytes added to every sealed datagram
    fn overhead(&self) -> usize;

    /// Seal a plaintext datagram for the peer
    fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Authenticate and decrypt a datagram from the peer.
    ///
    /// Returns [`crate::CryptoError::AuthFailure`] for anything that was not
    /// sealed by the peer of this session.
    fn open(&self, datagram: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// PSK-keyed channel with one key per direction
pub struct PskChannel {
    outbound: RecordCipher,
    inbound: RecordCipher,
}

impl PskChannel {
    /// Open the channel for `role` from derived session keys
    pub fn new(keys: &SessionKeys, role: Role) -> Self {
        let (outbound, inbound) = match role {
            Role::Client => (&keys.client_to_server, &keys.server_to_client),
            Role::Server => (&keys.server_to_client, &keys.client_to_server),
        };
        Self {
            outbound: RecordCipher::new(outbound),
            inbound: RecordCipher::new(inbound),
        }
    }
}

impl SecureDatagram for PskChannel {
    fn overhead(&self) -> usize {
        SEAL_OVERHEAD
    }

    fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.outbound.seal(plaintext)
    }

    fn open(&self, datagram: &[u8]) -> CryptoResult<Vec<u8>> {
        self.inbound.open(datagram)
    }
}

impl std::fmt::Debug for PskChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskChannel").finish_non_exhaustive()
    }
}
