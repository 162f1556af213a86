//! # Shroud Timing
//!
//! Timing obfuscation for shroud sessions:
//!
//! - **Jitter policies**: randomized per-frame delays or fixed-interval slots
//! - **Transmission scheduler**: bounded queue that releases frames on policy
//! - **Cover traffic**: runtime-adjustable dummy generation

pub mod dummy;
pub mod errors;
pub mod jitter;
pub mod scheduler;
pub mod stats;

pub use dummy::*;
pub use errors::*;
pub use jitter::*;
pub use scheduler::*;
pub use stats::*;

/// Prelude for common imports
pub mod prelude {
    pub use crate::dummy::{DummyGenerator, DummyRate};
    pub use crate::errors::{TimingError, TimingResult};
    pub use crate::jitter::{DelayDistribution, JitterMode, JitterPolicy};
    pub use crate::scheduler::{EnqueueOutcome, Release, TransmissionScheduler};
}
