//! # Shroud Protocol
//!
//! Wire-level pieces of the traffic-analysis-resistance layer. Nothing in
//! this crate touches a socket; the session runtime drives it.
//!
//! ## Components
//!
//! - **Padding**: bucket normalizer that hides true payload lengths
//! - **Frame**: inner frame codec shared by data, cover and control traffic
//! - **Handshake**: PSK hello exchange agreeing keys and hop parameters
//! - **Hopping**: deterministic hop instants and port pairs from a shared seed
//! - **Coordinator**: the per-session hop handoff state machine

pub mod constants;
pub mod padding;
pub mod frame;
pub mod handshake;
pub mod hopping;
pub mod coordinator;
pub mod session;
pub mod errors;

pub use constants::*;
pub use padding::*;
pub use frame::*;
pub use handshake::*;
pub use hopping::*;
pub use coordinator::*;
pub use session::*;
pub use errors::*;

/// Re-exported so downstream crates name roles through one path
pub use shroud_crypto::Role;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::constants::*;
    pub use crate::padding::*;
    pub use crate::frame::*;
    pub use crate::handshake::*;
    pub use crate::hopping::*;
    pub use crate::coordinator::*;
    pub use crate::session::*;
    pub use crate::errors::*;
    pub use shroud_crypto::Role;
}
