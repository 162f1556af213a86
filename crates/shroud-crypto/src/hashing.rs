//! BLAKE3 Hashing
//!
//! Keyed derivations used where both peers must compute the same value
//! from shared secret state without talking: hop offsets, hop ports and
//! hello proofs.

use blake3::{Hasher, OUT_LEN};

/// Hash output size (256 bits)
pub const HASH_SIZE: usize = OUT_LEN;

/// BLAKE3 hash function wrapper
pub struct ShroudHash;

impl ShroudHash {
    /// Hash data and return fixed-size output
    pub fn hash(data: &[u8]) -> [u8; HASH_SIZE] {
        *blake3::hash(data).as_bytes()
    }

    /// Create a keyed hash (MAC)
    pub fn keyed_hash(key: &[u8; HASH_SIZE], data: &[u8]) -> [u8; HASH_SIZE] {
        *blake3::keyed_hash(key, data).as_bytes()
    }

    /// Keyed hash over several pieces of data
    pub fn keyed_hash_many(key: &[u8; HASH_SIZE], data: &[&[u8]]) -> [u8; HASH_SIZE] {
        let mut hasher = Hasher::new_keyed(key);
        for d in data {
            hasher.update(d);
        }
        *hasher.finalize().as_bytes()
    }

    /// Derive a key from context and input
    pub fn derive_key(context: &str, input: &[u8]) -> [u8; HASH_SIZE] {
        blake3::derive_key(context, input)
    }

    /// Verify keyed hash in constant time
    pub fn verify_keyed(key: &[u8; HASH_SIZE], data: &[&[u8]], expected: &[u8; HASH_SIZE]) -> bool {
        let actual = Self::keyed_hash_many(key, data);
        constant_time_eq(&actual, expected)
    }
}

/// Deterministic stream of `u64` values drawn from a secret seed.
///
/// `label` separates independent uses of the same seed, `index` selects
/// the item (e.g. a hop number) and `attempt` lets callers redraw.
#[derive(Clone)]
pub struct SeededDraw {
    key: [u8; HASH_SIZE],
}

impl SeededDraw {
    /// Create from a 32-byte seed
    pub fn new(seed: &[u8; HASH_SIZE]) -> Self {
        Self { key: *seed }
    }

    /// Draw a value for `(label, index, attempt)`
    pub fn draw(&self, label: &[u8], index: u64, attempt: u32) -> u64 {
        let digest = ShroudHash::keyed_hash_many(
            &self.key,
            &[label, &index.to_le_bytes(), &attempt.to_le_bytes()],
        );
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(word)
    }

    /// Draw a value uniformly-ish within `[0, bound)`.
    ///
    /// Bias from the modulo is below 2^-40 for every bound this crate uses.
    pub fn draw_below(&self, label: &[u8], index: u64, attempt: u32, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.draw(label, index, attempt) % bound
    }
}

/// Constant-time comparison to prevent timing attacks
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
