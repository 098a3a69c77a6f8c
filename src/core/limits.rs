/*!
 * Transport Limits and Constants
 *
 * Centralized location for the buffer sizes, chunk sizes and poll intervals
 * used by the piping manager and its endpoints.
 */

use std::time::Duration;

// =============================================================================
// BUFFER SIZES
// =============================================================================

/// Default per-direction ring capacity for newly created pipes (128KB)
pub const DEFAULT_PIPE_BUFFER: usize = 128 * 1024;

/// Kernel-side buffer hint passed when creating a Windows named pipe (64KB)
pub const NAMED_PIPE_OS_BUFFER: u32 = 64 * 1024;

/// Maximum bytes handed to a single OS write call (16KB)
pub const PIPE_WRITE_CHUNK: usize = 16 * 1024;

/// Maximum bytes requested from a single OS read call (16KB)
pub const PIPE_READ_CHUNK: usize = 16 * 1024;

// =============================================================================
// TIMING
// =============================================================================

/// Idle time after which a pipe (or the whole session) is force-closed
pub const DEFAULT_PIPE_TIMEOUT: Duration = Duration::from_secs(10);

/// Supervisor poll period
/// [PERF] Timeouts are soft deadlines and may lag by up to one period
pub const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(1);

/// Worker sleep when an iteration moved no bytes
pub const PIPE_IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Caller-side sleep between retries of a short write or empty read
pub const PIPE_RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Smallest scratch buffer a worker allocates for OS transfers
#[inline]
pub const fn scratch_size() -> usize {
    if PIPE_WRITE_CHUNK > PIPE_READ_CHUNK {
        PIPE_WRITE_CHUNK
    } else {
        PIPE_READ_CHUNK
    }
}
