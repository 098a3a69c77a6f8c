/*!
 * Pipe Module
 * Named pipes / FIFOs shared with an external process, each pumped by its
 * own worker thread
 */

pub mod endpoint;
pub mod manager;
pub mod os;
mod supervisor;
pub mod timeout;
pub mod types;

// Re-export public API
pub use endpoint::PipeEndpoint;
pub use manager::PipingManager;
pub use timeout::TimeoutPipeOps;
pub use types::{PipeDirection, PipeError, PipeResult, PipeStats, PipeStatus, Transfer};
