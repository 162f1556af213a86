//! HKDF-SHA256 key schedule
//!
//! Expands a pre-shared key and the two handshake nonces into the
//! per-direction record keys and the hop seed.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::errors::{CryptoError, CryptoResult};

/// Key size in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Handshake nonce size in bytes
pub const HANDSHAKE_NONCE_SIZE: usize = 32;

const INFO_CLIENT_TO_SERVER: &[u8] = b"shroud v1 client->server";
const INFO_SERVER_TO_CLIENT: &[u8] = b"shroud v1 server->client";
const INFO_HOP_SEED: &[u8] = b"shroud v1 hop seed";
const INFO_HELLO: &[u8] = b"shroud v1 server hello";

/// HKDF-SHA256 wrapper
pub struct ShroudKdf;

impl ShroudKdf {
    /// Derive a single 32-byte key from input key material
    pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> CryptoResult<[u8; KEY_SIZE]> {
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = [0u8; KEY_SIZE];
        hk.expand(info, &mut okm)
            .map_err(|e| CryptoError::KdfError(e.to_string()))?;
        Ok(okm)
    }

    /// Derive the key that seals the ServerHello payload.
    ///
    /// Only the client nonce is known to both sides at that point.
    pub fn hello_key(
        psk: &[u8],
        client_nonce: &[u8; HANDSHAKE_NONCE_SIZE],
    ) -> CryptoResult<[u8; KEY_SIZE]> {
        Self::derive_key(psk, client_nonce, INFO_HELLO)
    }
}

/// Keying material shared by both ends of one session.
///
/// Created once after the handshake and only ever read afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Seals client -> server records
    pub client_to_server: [u8; KEY_SIZE],
    /// Seals server -> client records
    pub server_to_client: [u8; KEY_SIZE],
    /// Seed for the hop schedule and port derivation
    pub hop_seed: [u8; KEY_SIZE],
}

impl SessionKeys {
    /// Derive session keys from the PSK and both handshake nonces
    pub fn derive(
        psk: &[u8],
        client_nonce: &[u8; HANDSHAKE_NONCE_SIZE],
        server_nonce: &[u8; HANDSHAKE_NONCE_SIZE],
    ) -> CryptoResult<Self> {
        let mut salt = [0u8; HANDSHAKE_NONCE_SIZE * 2];
        salt[..HANDSHAKE_NONCE_SIZE].copy_from_slice(client_nonce);
        salt[HANDSHAKE_NONCE_SIZE..].copy_from_slice(server_nonce);

        let hk = Hkdf::<Sha256>::new(Some(&salt), psk);
        let mut keys = Self {
            client_to_server: [0u8; KEY_SIZE],
            server_to_client: [0u8; KEY_SIZE],
            hop_seed: [0u8; KEY_SIZE],
        };
        for (info, out) in [
            (INFO_CLIENT_TO_SERVER, &mut keys.client_to_server),
            (INFO_SERVER_TO_CLIENT, &mut keys.server_to_client),
            (INFO_HOP_SEED, &mut keys.hop_seed),
        ] {
            hk.expand(info, out)
                .map_err(|e| CryptoError::KdfError(e.to_string()))?;
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = SessionKeys::derive(b"psk", &[1u8; 32], &[2u8; 32]).unwrap();
        let b = SessionKeys::derive(b"psk", &[1u8; 32], &[2u8; 32]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_directions_and_seed_differ() {
        let keys = SessionKeys::derive(b"psk", &[1u8; 32], &[2u8; 32]).unwrap();
        assert_ne!(keys.client_to_server, keys.server_to_client);
        assert_ne!(keys.client_to_server, keys.hop_seed);
    }

    #[test]
    fn test_nonces_change_keys() {
        let a = SessionKeys::derive(b"psk", &[1u8; 32], &[2u8; 32]).unwrap();
        let b = SessionKeys::derive(b"psk", &[1u8; 32], &[3u8; 32]).unwrap();
        assert_ne!(a.hop_seed, b.hop_seed);
    }

    #[test]
    fn test_debug_hides_material() {
        let keys = SessionKeys::derive(b"psk", &[1u8; 32], &[2u8; 32]).unwrap();
        let rendered = format!("{:?}", keys);
        assert_eq!(rendered, "SessionKeys { .. }");
    }
}
