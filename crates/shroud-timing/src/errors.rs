//! Timing Errors
//!
//! Error types for scheduling and cover traffic.

use thiserror::Error;

/// Result type for timing operations
pub type TimingResult<T> = Result<T, TimingError>;

/// Timing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimingError {
    /// Invalid timing configuration
    #[error("Invalid timing configuration: {0}")]
    InvalidConfig(String),

    /// Queue is full of real frames
    #[error("Transmission queue full ({depth}/{bound} frames)")]
    Backpressure { depth: usize, bound: usize },

    /// Scheduler stopped
    #[error("Scheduler has been stopped")]
    SchedulerStopped,

    /// Channel closed
    #[error("Timing channel closed")]
    ChannelClosed,
}
