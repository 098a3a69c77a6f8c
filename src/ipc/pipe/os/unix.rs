/*!
 * POSIX FIFO Backend
 * mkfifo-based pipes opened non-blocking by the worker thread
 */

use super::{Canceller, PipeBackend};
use crate::core::limits::PIPE_IDLE_BACKOFF;
use crate::ipc::pipe::types::PipeDirection;
use nix::libc;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::thread;
use tracing::warn;

/// FIFO special file plus the descriptor opened on it
///
/// The descriptor lives in a `File`, so it is closed on every exit path.
#[derive(Debug)]
pub struct OsPipe {
    path: PathBuf,
    direction: PipeDirection,
    file: Option<File>,
    // Set once the peer has delivered data; a later EOF means it went away
    peer_seen: bool,
}

impl OsPipe {
    /// Replace whatever sits at `path` with a fresh FIFO
    pub fn create(path: &Path, direction: PipeDirection) -> io::Result<Self> {
        ignore_sigpipe();

        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IROTH | Mode::S_IWOTH;
        mkfifo(path, mode).map_err(io::Error::from)?;

        Ok(Self {
            path: path.to_path_buf(),
            direction,
            file: None,
            peer_seen: false,
        })
    }

    /// Path handed to the external process
    pub fn os_path(&self) -> String {
        self.path.display().to_string()
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "pipe is not open"))
    }
}

impl PipeBackend for OsPipe {
    fn connect(&mut self, stop: &AtomicBool) -> io::Result<()> {
        let mut options = OpenOptions::new();
        options
            .read(self.direction.reads_from_os())
            .write(self.direction.writes_to_os())
            .custom_flags(libc::O_NONBLOCK);

        loop {
            match options.open(&self.path) {
                Ok(file) => {
                    self.file = Some(file);
                    return Ok(());
                }
                // ENXIO: write-only open with no reader attached yet
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    if stop.load(Ordering::Acquire) {
                        return Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "stopped before the remote end opened the pipe",
                        ));
                    }
                    thread::sleep(PIPE_IDLE_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let peer_seen = self.peer_seen;
        let result = self.file()?.read(buf);
        match result {
            Ok(0) if peer_seen && !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "remote end closed the pipe",
            )),
            Ok(n) => {
                if n > 0 {
                    self.peer_seen = true;
                }
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file()?.write(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            other => other,
        }
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn canceller(&self) -> Canceller {
        // Every call is non-blocking; the stop flag alone ends the worker
        Canceller::noop()
    }
}

fn ignore_sigpipe() {
    static IGNORE_SIGPIPE: Once = Once::new();
    IGNORE_SIGPIPE.call_once(|| {
        // SAFETY: SIG_IGN installs no handler code, so no async-signal-safety concerns
        if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            warn!(error = %e, "Could not ignore SIGPIPE; a vanished reader may kill the process");
        }
    });
}
