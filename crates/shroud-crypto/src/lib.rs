//! # Shroud Crypto
//!
//! The secure-datagram collaborator underneath the obfuscation layer.
//!
//! ## Components
//!
//! - **KDF**: HKDF-SHA256 expanding a PSK and handshake nonces into
//!   per-direction record keys and the hop seed
//! - **Encryption**: ChaCha20-Poly1305 record sealing
//! - **Channel**: [`SecureDatagram`] trait and the PSK-keyed implementation
//! - **Hashing**: BLAKE3 keyed derivations shared by both peers
//! - **PSK**: credential parsing and generation

pub mod kdf;
pub mod encryption;
pub mod channel;
pub mod hashing;
pub mod psk;
pub mod errors;

pub use kdf::*;
pub use encryption::*;
pub use channel::*;
pub use hashing::*;
pub use psk::*;
pub use errors::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::kdf::*;
    pub use crate::encryption::*;
    pub use crate::channel::*;
    pub use crate::hashing::*;
    pub use crate::psk::*;
    pub use crate::errors::*;
}
