//! Scripted in-memory backend for exercising the worker state machine

use super::{Canceller, PipeBackend};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Pipe whose writes come back out of its reads
#[derive(Clone, Default)]
pub(crate) struct LoopbackBackend {
    pub queue: Arc<Mutex<VecDeque<u8>>>,
    pub refuse_connect: bool,
    pub wait_for_stop: bool,
    pub write_error: Option<io::ErrorKind>,
    pub read_error: Option<io::ErrorKind>,
    pub max_write: Option<usize>,
}

impl PipeBackend for LoopbackBackend {
    fn connect(&mut self, stop: &AtomicBool) -> io::Result<()> {
        if self.refuse_connect {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        while self.wait_for_stop {
            if stop.load(Ordering::Acquire) {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(kind) = self.read_error {
            return Err(io::Error::from(kind));
        }
        let mut queue = self.queue.lock();
        let n = buf.len().min(queue.len());
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.write_error {
            return Err(io::Error::from(kind));
        }
        let n = self.max_write.map_or(buf.len(), |max| buf.len().min(max));
        self.queue.lock().extend(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self) {}

    fn canceller(&self) -> Canceller {
        Canceller::noop()
    }
}

/// Poll `condition` every couple of milliseconds until it holds or `timeout` passes
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
