/*!
 * Pipe Transport Library
 * Named-pipe transport and lifecycle manager for streaming bytes to and from
 * external codec processes
 *
 * A [`PipingManager`] creates OS named pipes (FIFOs on POSIX, `\\.\pipe\`
 * objects on Windows) and hands back ids. Every pipe is pumped by its own
 * worker thread through a bounded [`RingBuffer`], so `write_to_pipe` and
 * `read_from_pipe` only ever copy memory. A supervisor thread force-closes
 * pipes that stay idle past the configured timeout.
 *
 * ```no_run
 * use pipe_transport::{PipeDirection, PipingManager, TimeoutPipeOps};
 * use std::sync::Arc;
 * use std::time::Duration;
 *
 * # fn main() -> miette::Result<()> {
 * let manager = Arc::new(PipingManager::new());
 * let frames = manager.create_named_pipe("/tmp/enc_in.yuv", PipeDirection::Input)?;
 * let bitstream = manager.create_named_pipe("/tmp/enc_out.265", PipeDirection::Output)?;
 *
 * // ... start the external encoder on both paths ...
 *
 * let ops = TimeoutPipeOps::new(Arc::clone(&manager));
 * ops.write_all(frames, &[0u8; 4096], Some(Duration::from_secs(5)))?;
 * manager.close_pipe(frames)?;
 * let encoded = ops.drain(bitstream, Some(Duration::from_secs(30)))?;
 * # let _ = encoded;
 * manager.close();
 * # Ok(())
 * # }
 * ```
 */

pub mod config;
pub mod core;
pub mod ipc;
pub mod monitoring;

// Re-exports
pub use config::PipingConfig;
pub use core::types::{PipeId, Size};
pub use ipc::pipe::{
    PipeDirection, PipeError, PipeResult, PipeStats, PipeStatus, PipingManager, TimeoutPipeOps,
    Transfer,
};
pub use ipc::ring::{RingBuffer, RingError};
pub use monitoring::init_tracing;
