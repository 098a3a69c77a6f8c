/*!
 * Platform Abstraction
 * One interface over the OS calls a pipe worker needs: connect, read,
 * write, close and cancel
 */

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[cfg(test)]
pub(crate) mod loopback;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::OsPipe;
#[cfg(windows)]
pub use windows::OsPipe;

/// OS side of one pipe endpoint, owned and driven by its worker thread
///
/// `read` and `write` report "nothing moved right now" either as `Ok(0)` or
/// as an `io::ErrorKind::WouldBlock` error. A vanished peer on the read side
/// is reported as `io::ErrorKind::BrokenPipe`.
pub trait PipeBackend: Send + 'static {
    /// Attach to the remote end. Gives up with an error once `stop` is raised.
    fn connect(&mut self, stop: &AtomicBool) -> io::Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Release the OS handle. Must be idempotent.
    fn close(&mut self);

    /// Handle used by other threads to interrupt a blocking call
    fn canceller(&self) -> Canceller;
}

/// Interrupts whatever blocking call the worker is currently inside
#[derive(Clone, Default)]
pub struct Canceller {
    cancel_fn: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Canceller {
    /// Canceller for backends that never block
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn new<F>(cancel_fn: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            cancel_fn: Some(Arc::new(cancel_fn)),
        }
    }

    pub fn cancel(&self) {
        if let Some(ref cancel_fn) = self.cancel_fn {
            cancel_fn();
        }
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("active", &self.cancel_fn.is_some())
            .finish()
    }
}

/// Kernel object name of a Windows named pipe for a filesystem path
///
/// Only the last path component is kept: `C:\tmp\enc_in.yuv` becomes
/// `\\.\pipe\enc_in.yuv`.
#[cfg_attr(not(windows), allow(dead_code))]
pub fn windows_pipe_name(path: &Path) -> String {
    let path = path.to_string_lossy();
    let base = path.rsplit(|c| c == '\\' || c == '/').next().unwrap_or("");
    format!(r"\\.\pipe\{}", base)
}
