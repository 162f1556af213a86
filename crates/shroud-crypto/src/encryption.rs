//! ChaCha20-Poly1305 AEAD Encryption
//!
//! Record sealing for datagrams: `nonce || ciphertext || tag`.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

use crate::errors::{CryptoError, CryptoResult};
use crate::kdf::KEY_SIZE;

/// Nonce size for ChaCha20-Poly1305 (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits)
pub const TAG_SIZE: usize = 16;

/// Bytes a sealed record adds on top of its plaintext
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// ChaCha20-Poly1305 cipher bound to one key
pub struct RecordCipher {
    cipher: ChaCha20Poly1305,
}

impl RecordCipher {
    /// Create a new cipher with the given key
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt plaintext with specified nonce, returning ciphertext with tag
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> CryptoResult<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionError("ChaCha20-Poly1305 encryption failed".into()))
    }

    /// Decrypt ciphertext produced with `nonce`
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_SIZE]) -> CryptoResult<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthFailure)
    }

    /// Seal plaintext into a self-contained record with a random nonce
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = Self::generate_nonce()?;
        let ciphertext = self.encrypt_with_nonce(plaintext, &nonce)?;

        let mut record = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Open a record produced by [`RecordCipher::seal`]
    pub fn open(&self, record: &[u8]) -> CryptoResult<Vec<u8>> {
        if record.len() < SEAL_OVERHEAD {
            return Err(CryptoError::AuthFailure);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&record[..NONCE_SIZE]);
        self.decrypt(&record[NONCE_SIZE..], &nonce)
    }

    /// Generate a random nonce
    pub fn generate_nonce() -> CryptoResult<[u8; NONCE_SIZE]> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng()
            .try_fill_bytes(&mut nonce)
            .map_err(|_| CryptoError::RngError)?;
        Ok(nonce)
    }

    /// Sealed record length for a given plaintext length
    pub fn sealed_len(plaintext_len: usize) -> usize {
        plaintext_len + SEAL_OVERHEAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    #[test]
    fn test_seal_open() {
        let cipher = RecordCipher::new(&test_key());
        let record = cipher.seal(b"sensor reading").unwrap();

        assert_eq!(record.len(), RecordCipher::sealed_len(14));
        assert_eq!(cipher.open(&record).unwrap(), b"sensor reading");
    }

    #[test]
    fn test_tampered_record_fails() {
        let cipher = RecordCipher::new(&test_key());
        let mut record = cipher.seal(b"original").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0x01;

        assert_eq!(cipher.open(&record), Err(CryptoError::AuthFailure));
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut other = test_key();
        other[0] ^= 0xFF;

        let record = RecordCipher::new(&test_key()).seal(b"secret").unwrap();
        assert!(RecordCipher::new(&other).open(&record).is_err());
    }

    #[test]
    fn test_short_record_fails() {
        let cipher = RecordCipher::new(&test_key());
        assert_eq!(cipher.open(&[0u8; 10]), Err(CryptoError::AuthFailure));
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = RecordCipher::new(&test_key());
        let record = cipher.seal(b"").unwrap();
        assert_eq!(record.len(), SEAL_OVERHEAD);
        assert!(cipher.open(&record).unwrap().is_empty());
    }
}
