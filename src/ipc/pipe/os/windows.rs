/*!
 * Windows Named Pipe Backend
 * CreateNamedPipe kernel objects, connected and driven with blocking calls
 */

use super::{windows_pipe_name, Canceller, PipeBackend};
use crate::core::limits::NAMED_PIPE_OS_BUFFER;
use crate::ipc::pipe::types::PipeDirection;
use parking_lot::Mutex;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use windows::core::HSTRING;
use windows::Win32::Foundation::{CloseHandle, ERROR_BROKEN_PIPE, ERROR_PIPE_CONNECTED, HANDLE};
use windows::Win32::Storage::FileSystem::{
    ReadFile, WriteFile, PIPE_ACCESS_DUPLEX, PIPE_ACCESS_INBOUND, PIPE_ACCESS_OUTBOUND,
};
use windows::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
};
use windows::Win32::System::IO::CancelIoEx;

/// Raw handle value shared with the canceller; cleared before the handle is closed
type SharedRawHandle = Arc<Mutex<Option<isize>>>;

/// Owned pipe handle, closed on drop
struct PipeHandle {
    handle: HANDLE,
    shared: SharedRawHandle,
}

// SAFETY: a pipe HANDLE may be used from any thread; only the worker uses it
// for I/O and the canceller only ever calls CancelIoEx on it.
unsafe impl Send for PipeHandle {}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        // Take the raw value first so the canceller never sees a closed handle
        self.shared.lock().take();
        // SAFETY: the handle came from CreateNamedPipeW and is closed exactly once
        if let Err(e) = unsafe { CloseHandle(self.handle) } {
            debug!(error = %e, "CloseHandle failed for pipe");
        }
    }
}

pub struct OsPipe {
    name: String,
    handle: Option<PipeHandle>,
    shared: SharedRawHandle,
}

impl OsPipe {
    /// Create the `\\.\pipe\<basename>` kernel object for `path`
    pub fn create(path: &Path, direction: PipeDirection) -> io::Result<Self> {
        let name = windows_pipe_name(path);
        let access = match direction {
            PipeDirection::Input => PIPE_ACCESS_OUTBOUND,
            PipeDirection::Output => PIPE_ACCESS_INBOUND,
            PipeDirection::Duplex => PIPE_ACCESS_DUPLEX,
        };

        // SAFETY: all pointers passed are valid for the duration of the call
        let handle = unsafe {
            CreateNamedPipeW(
                &HSTRING::from(name.as_str()),
                access,
                PIPE_WAIT | PIPE_TYPE_BYTE | PIPE_READMODE_BYTE,
                1,
                NAMED_PIPE_OS_BUFFER,
                NAMED_PIPE_OS_BUFFER,
                // NMPWAIT_USE_DEFAULT_WAIT
                0,
                None,
            )
        };
        if handle.is_invalid() {
            return Err(io::Error::last_os_error());
        }

        let shared = Arc::new(Mutex::new(Some(handle.0 as isize)));
        Ok(Self {
            name,
            handle: Some(PipeHandle {
                handle,
                shared: shared.clone(),
            }),
            shared,
        })
    }

    /// Kernel object name handed to the external process
    pub fn os_path(&self) -> String {
        self.name.clone()
    }

    fn raw(&self) -> io::Result<HANDLE> {
        self.handle
            .as_ref()
            .map(|h| h.handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "pipe is not open"))
    }
}

fn to_io_error(e: windows::core::Error) -> io::Error {
    if e.code() == ERROR_BROKEN_PIPE.to_hresult() {
        io::Error::new(io::ErrorKind::BrokenPipe, e)
    } else {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

impl PipeBackend for OsPipe {
    fn connect(&mut self, stop: &AtomicBool) -> io::Result<()> {
        if stop.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "stopped before the remote end opened the pipe",
            ));
        }
        let handle = self.raw()?;
        // SAFETY: synchronous connect on a handle we own; CancelIoEx interrupts it
        match unsafe { ConnectNamedPipe(handle, None) } {
            Ok(()) => Ok(()),
            // Client attached between CreateNamedPipe and ConnectNamedPipe
            Err(e) if e.code() == ERROR_PIPE_CONNECTED.to_hresult() => Ok(()),
            Err(e) => Err(to_io_error(e)),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.raw()?;
        let mut read = 0u32;
        // SAFETY: `buf` outlives the synchronous call and `read` is a valid out pointer
        unsafe { ReadFile(handle, Some(buf), Some(&mut read as *mut u32), None) }
            .map_err(to_io_error)?;
        Ok(read as usize)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let handle = self.raw()?;
        let mut written = 0u32;
        // SAFETY: `buf` outlives the synchronous call and `written` is a valid out pointer
        unsafe { WriteFile(handle, Some(buf), Some(&mut written as *mut u32), None) }
            .map_err(to_io_error)?;
        Ok(written as usize)
    }

    fn close(&mut self) {
        self.handle = None;
    }

    fn canceller(&self) -> Canceller {
        let shared = self.shared.clone();
        Canceller::new(move || {
            let guard = shared.lock();
            if let Some(raw) = *guard {
                // SAFETY: the handle stays open while the lock is held (see PipeHandle::drop)
                let _ = unsafe { CancelIoEx(HANDLE(raw as *mut _), None) };
            }
        })
    }
}
