//! # Shroud Session
//!
//! Session continuity runtime. Each session runs as one actor task that
//! owns its queue, hop state and reliability windows; a shared socket pool
//! feeds every inbound datagram through a trial-decrypt demultiplexer.
//!
//! ## Architecture
//!
//! ```text
//!   send() ──► ContinuityManager ──► SessionActor ──► SocketPool ──► transport
//!                     ▲                  │ ▲
//!                     │   snapshots      │ │ Inbound / AuthFailure
//!                     └──────────────────┘ │
//!   transport ──► read loops ──► demux ────┘
//! ```
//!
//! Transports are pluggable: plain UDP, UDP through a SOCKS5 proxy, or an
//! in-memory network with latency and loss for tests.

mod actor;
pub mod config;
pub mod continuity;
pub mod errors;
pub mod events;
pub mod memory;
pub mod pool;
pub mod reliability;
pub mod snapshot;
pub mod socks;
pub mod transport;

pub use config::*;
pub use continuity::*;
pub use errors::*;
pub use events::*;
pub use memory::*;
pub use pool::*;
pub use reliability::*;
pub use snapshot::*;
pub use socks::*;
pub use transport::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{SessionConfig, SessionConfigBuilder};
    pub use crate::continuity::{ContinuityManager, SessionHandle, SessionParams};
    pub use crate::errors::{SessionError, SessionResult};
    pub use crate::events::{CloseReason, EventSink, ObfuscationEvent};
    pub use crate::snapshot::SessionSnapshot;
    pub use crate::transport::{DatagramSocket, DatagramTransport, UdpTransport};
}
