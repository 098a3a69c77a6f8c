/*!
 * IPC Module
 * Byte transport between this process and external codec processes
 */

pub mod pipe;
pub mod ring; // Bounded byte ring buffer backing every pipe endpoint

// Re-export for convenience
pub use pipe::{
    PipeDirection, PipeError, PipeResult, PipeStats, PipeStatus, PipingManager, TimeoutPipeOps,
    Transfer,
};
pub use ring::{RingBuffer, RingError, RingResult};
