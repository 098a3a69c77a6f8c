/*!
 * Pipe Endpoint
 * One OS pipe, its ring buffers and the worker thread that moves bytes
 * between them
 */

use super::os::{Canceller, PipeBackend};
use super::types::{PipeDirection, PipeError, PipeResult, PipeStats, PipeStatus, Transfer};
use crate::core::limits::{self, PIPE_IDLE_BACKOFF, PIPE_READ_CHUNK, PIPE_WRITE_CHUNK};
use crate::core::types::{IdleMillis, PipeId, Size};
use crate::ipc::ring::RingBuffer;
use parking_lot::Mutex;
use std::io;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

/// Both directions of an endpoint, guarded by one mutex
#[derive(Debug)]
pub(crate) struct PipeBuffers {
    /// Caller -> OS pipe
    pub input: RingBuffer,
    /// OS pipe -> caller
    pub output: RingBuffer,
}

impl PipeBuffers {
    fn new(direction: PipeDirection, capacity: Size) -> Self {
        let sized = |enabled: bool| RingBuffer::new(if enabled { capacity } else { 0 });
        Self {
            input: sized(direction.writes_to_os()),
            output: sized(direction.reads_from_os()),
        }
    }

    fn is_drained(&self) -> bool {
        self.input.is_empty() && self.output.is_empty()
    }
}

/// State shared between the endpoint handle and its worker thread
#[derive(Debug)]
struct EndpointShared {
    buffers: Mutex<PipeBuffers>,
    status: AtomicU8,
    error: Mutex<Option<String>>,
    idle_micros: AtomicU64,
    // Microseconds after `epoch` at which bytes last moved
    last_activity: AtomicU64,
    epoch: Instant,
    stop: AtomicBool,
    close_when_drained: AtomicBool,
    running: AtomicBool,
    connected: AtomicBool,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl EndpointShared {
    fn status(&self) -> PipeStatus {
        PipeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move from `Ok` to a terminal status. Terminal statuses are never replaced.
    fn transition(&self, status: PipeStatus, message: Option<String>) -> bool {
        let won = self
            .status
            .compare_exchange(
                PipeStatus::Ok.as_u8(),
                status.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            if let Some(message) = message {
                *self.error.lock() = Some(message);
            }
        }
        won
    }

    fn fail(&self, status: PipeStatus, message: String) {
        if self.transition(status, Some(message.clone())) {
            warn!(status = %status, error = %message, "Pipe failed");
        }
    }

    fn age_micros(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn touch(&self) {
        self.last_activity.store(self.age_micros(), Ordering::Release);
        self.idle_micros.store(0, Ordering::Release);
    }
}

/// A named pipe endpoint with its background worker
///
/// Callers only ever copy bytes into or out of the ring buffers; all
/// blocking OS I/O happens on the worker thread.
pub struct PipeEndpoint {
    id: PipeId,
    path: String,
    direction: PipeDirection,
    shared: Arc<EndpointShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    canceller: Canceller,
}

impl std::fmt::Debug for PipeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buffers = self.shared.buffers.lock();
        f.debug_struct("PipeEndpoint")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("direction", &self.direction)
            .field("status", &self.shared.status())
            .field("input_buffered", &buffers.input.taken())
            .field("output_buffered", &buffers.output.taken())
            .finish()
    }
}

impl PipeEndpoint {
    /// Start the worker for an already created OS pipe
    pub fn spawn<B: PipeBackend>(
        id: PipeId,
        path: String,
        direction: PipeDirection,
        capacity: Size,
        backend: B,
    ) -> PipeResult<Self> {
        let shared = Arc::new(EndpointShared {
            buffers: Mutex::new(PipeBuffers::new(direction, capacity)),
            status: AtomicU8::new(PipeStatus::Ok.as_u8()),
            error: Mutex::new(None),
            idle_micros: AtomicU64::new(0),
            last_activity: AtomicU64::new(0),
            epoch: Instant::now(),
            stop: AtomicBool::new(false),
            close_when_drained: AtomicBool::new(false),
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        });

        let canceller = backend.canceller();
        let worker_shared = Arc::clone(&shared);
        let worker_path = path.clone();
        let handle = thread::Builder::new()
            .name(format!("pipe-worker-{}", id))
            .spawn(move || run_worker(worker_shared, backend, direction, id, worker_path))
            .map_err(|source| PipeError::Spawn { id, source })?;

        Ok(Self {
            id,
            path,
            direction,
            shared,
            worker: Mutex::new(Some(handle)),
            canceller,
        })
    }

    #[inline]
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// OS path (or kernel object name) of the pipe
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn direction(&self) -> PipeDirection {
        self.direction
    }

    #[inline]
    pub fn status(&self) -> PipeStatus {
        self.shared.status()
    }

    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Queue as much of `data` as fits in the input ring
    ///
    /// Nothing is queued once the pipe has left `Ok`.
    pub fn write(&self, data: &[u8]) -> Transfer {
        let mut buffers = self.shared.buffers.lock();
        let status = self.shared.status();
        if !status.is_ok() {
            return Transfer::new(0, status);
        }

        let accepted = data.len().min(buffers.input.free());
        match buffers.input.append(&data[..accepted]) {
            Ok(()) => Transfer::new(accepted, status),
            Err(_) => Transfer::new(0, PipeStatus::BufferFull),
        }
    }

    /// Copy out up to `out.len()` bytes that already arrived from the OS pipe
    ///
    /// Bytes left in the output ring stay readable after the pipe reaches a
    /// terminal status.
    pub fn read(&self, out: &mut [u8]) -> Transfer {
        let mut buffers = self.shared.buffers.lock();
        let available = out.len().min(buffers.output.taken());
        let copied = match buffers.output.pop_front(&mut out[..available]) {
            Ok(()) => available,
            Err(_) => 0,
        };
        Transfer::new(copied, self.shared.status())
    }

    /// Bytes waiting in the output ring
    pub fn data_ready(&self) -> Transfer {
        let buffers = self.shared.buffers.lock();
        Transfer::new(buffers.output.taken(), self.shared.status())
    }

    /// Free space in the input ring
    pub fn buffer_free(&self) -> Transfer {
        let buffers = self.shared.buffers.lock();
        Transfer::new(buffers.input.free(), self.shared.status())
    }

    /// Let the worker finish on its own once both rings are empty
    pub fn close_when_drained(&self) {
        self.shared.close_when_drained.store(true, Ordering::Release);
    }

    pub fn close_requested(&self) -> bool {
        self.shared.close_when_drained.load(Ordering::Acquire)
    }

    /// Milliseconds since the last byte moved through the OS pipe
    pub fn idle_ms(&self) -> IdleMillis {
        self.shared.idle_micros.load(Ordering::Acquire) as f64 / 1000.0
    }

    /// Add `elapsed` to the idle accumulator and return the new value
    ///
    /// The accumulator never exceeds the time since bytes last moved, so a
    /// transfer shortly before a supervisor tick only counts from that transfer.
    pub fn add_idle(&self, elapsed: Duration) -> IdleMillis {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let shared = &self.shared;
        let since_activity = shared
            .age_micros()
            .saturating_sub(shared.last_activity.load(Ordering::Acquire));
        let updated = shared
            .idle_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| {
                Some(idle.saturating_add(micros).min(since_activity))
            })
            .map_or(0, |previous| previous.saturating_add(micros).min(since_activity));
        updated as f64 / 1000.0
    }

    /// Stop the worker and wait for it to exit
    ///
    /// Safe to call repeatedly and from several threads; every caller returns
    /// only after the worker is gone.
    pub fn close_thread(&self) {
        self.shared.stop.store(true, Ordering::Release);

        let mut worker = self.worker.lock();
        let Some(handle) = worker.take() else {
            return;
        };

        while !handle.is_finished() {
            self.canceller.cancel();
            thread::sleep(PIPE_IDLE_BACKOFF);
        }

        if handle.join().is_err() {
            self.shared.fail(
                PipeStatus::UnknownError,
                "pipe worker thread panicked".to_string(),
            );
        }
        self.shared.running.store(false, Ordering::Release);
    }

    /// Record `status` and stop the worker
    ///
    /// A pipe whose own open never completed is recorded as `ConnectError`
    /// rather than `Timeout`. On POSIX only input pipes wait in open; output
    /// and duplex FIFOs open at once, so they time out as `Timeout`.
    pub fn force_close(&self, status: PipeStatus) {
        let (status, message) = if !self.is_connected() && status == PipeStatus::Timeout {
            (
                PipeStatus::ConnectError,
                format!(
                    "remote end did not connect within {:.0}ms",
                    self.idle_ms()
                ),
            )
        } else {
            (status, format!("force-closed after {:.0}ms idle", self.idle_ms()))
        };

        if self.shared.transition(status, Some(message)) {
            info!(pipe_id = self.id, status = %status, "Pipe force-closed");
        }
        self.close_thread();
    }

    pub fn stats(&self) -> PipeStats {
        let buffers = self.shared.buffers.lock();
        PipeStats {
            id: self.id,
            path: self.path.clone(),
            direction: self.direction,
            status: self.shared.status(),
            running: self.is_running(),
            connected: self.is_connected(),
            input_buffered: buffers.input.taken(),
            input_capacity: buffers.input.size(),
            output_buffered: buffers.output.taken(),
            output_capacity: buffers.output.size(),
            idle_ms: self.idle_ms(),
            bytes_written: self.shared.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.shared.bytes_read.load(Ordering::Relaxed),
            close_requested: self.close_requested(),
            error: self.error(),
        }
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        self.close_thread();
    }
}

/// Worker state machine: connect, then pump until stopped or failed
fn run_worker<B: PipeBackend>(
    shared: Arc<EndpointShared>,
    mut backend: B,
    direction: PipeDirection,
    id: PipeId,
    path: String,
) {
    let span = info_span!("pipe_worker", pipe_id = id, path = %path);
    let _entered = span.enter();

    if let Err(e) = backend.connect(&shared.stop) {
        shared.fail(PipeStatus::ConnectError, format!("connect failed: {}", e));
        backend.close();
        shared.running.store(false, Ordering::Release);
        return;
    }
    shared.connected.store(true, Ordering::Release);
    info!(direction = %direction, "Pipe connected");

    let mut scratch = vec![0u8; limits::scratch_size()];

    while !shared.stop.load(Ordering::Acquire) {
        let mut moved = 0;

        if direction.writes_to_os() {
            match pump_out(&shared, &mut backend, &mut scratch) {
                ControlFlow::Continue(n) => moved += n,
                ControlFlow::Break(()) => break,
            }
        }

        if direction.reads_from_os() {
            match pump_in(&shared, &mut backend, &mut scratch) {
                ControlFlow::Continue(n) => moved += n,
                ControlFlow::Break(()) => break,
            }
        }

        if shared.close_when_drained.load(Ordering::Acquire) && shared.buffers.lock().is_drained() {
            info!("Pipe drained, closing");
            break;
        }

        if moved == 0 {
            thread::sleep(PIPE_IDLE_BACKOFF);
        }
    }

    backend.close();
    shared.transition(PipeStatus::PipeClosed, None);
    shared.running.store(false, Ordering::Release);
    info!(
        status = %shared.status(),
        bytes_written = shared.bytes_written.load(Ordering::Relaxed),
        bytes_read = shared.bytes_read.load(Ordering::Relaxed),
        "Pipe worker exited"
    );
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Input ring -> OS pipe, at most one write chunk per call
fn pump_out<B: PipeBackend>(
    shared: &EndpointShared,
    backend: &mut B,
    scratch: &mut [u8],
) -> ControlFlow<(), usize> {
    let pending = {
        let buffers = shared.buffers.lock();
        let pending = buffers.input.taken().min(PIPE_WRITE_CHUNK);
        if buffers.input.peek_front(&mut scratch[..pending]).is_err() {
            0
        } else {
            pending
        }
    };
    if pending == 0 {
        return ControlFlow::Continue(0);
    }

    match backend.write(&scratch[..pending]) {
        Ok(0) => ControlFlow::Continue(0),
        Ok(written) => {
            // Only this thread consumes the input ring, so the peeked bytes are still at the front
            if let Err(e) = shared.buffers.lock().input.discard_front(written) {
                shared.fail(PipeStatus::UnknownError, format!("input accounting: {}", e));
                return ControlFlow::Break(());
            }
            shared.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
            shared.touch();
            debug!(bytes = written, "Wrote to pipe");
            ControlFlow::Continue(written)
        }
        Err(e) if is_transient(&e) => ControlFlow::Continue(0),
        Err(e) => {
            shared.fail(PipeStatus::WriteError, format!("write failed: {}", e));
            ControlFlow::Break(())
        }
    }
}

/// OS pipe -> output ring, at most one read chunk per call
fn pump_in<B: PipeBackend>(
    shared: &EndpointShared,
    backend: &mut B,
    scratch: &mut [u8],
) -> ControlFlow<(), usize> {
    let wanted = shared.buffers.lock().output.free().min(PIPE_READ_CHUNK);
    if wanted == 0 {
        return ControlFlow::Continue(0);
    }

    match backend.read(&mut scratch[..wanted]) {
        Ok(0) => ControlFlow::Continue(0),
        Ok(read) => {
            // Free space only grows while unlocked: callers pop, only this thread appends
            if let Err(e) = shared.buffers.lock().output.append(&scratch[..read]) {
                shared.fail(PipeStatus::UnknownError, format!("output accounting: {}", e));
                return ControlFlow::Break(());
            }
            shared.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
            shared.touch();
            debug!(bytes = read, "Read from pipe");
            ControlFlow::Continue(read)
        }
        Err(e) if is_transient(&e) => ControlFlow::Continue(0),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            info!(reason = %e, "Remote end closed pipe");
            shared.transition(PipeStatus::PipeClosed, Some(e.to_string()));
            ControlFlow::Break(())
        }
        Err(e) => {
            shared.fail(PipeStatus::ReadError, format!("read failed: {}", e));
            ControlFlow::Break(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::pipe::os::loopback::{wait_until, LoopbackBackend};

    fn spawn(direction: PipeDirection, capacity: Size, backend: LoopbackBackend) -> PipeEndpoint {
        PipeEndpoint::spawn(1, "loopback".to_string(), direction, capacity, backend).unwrap()
    }

    #[test]
    fn test_duplex_loopback_round_trip() {
        let backend = LoopbackBackend {
            max_write: Some(3),
            ..Default::default()
        };
        let endpoint = spawn(PipeDirection::Duplex, 64, backend);

        let sent = endpoint.write(b"hello, pipe");
        assert_eq!(sent, Transfer::new(11, PipeStatus::Ok));

        assert!(wait_until(Duration::from_secs(2), || endpoint
            .data_ready()
            .bytes
            == 11));

        let mut out = [0u8; 32];
        let received = endpoint.read(&mut out);
        assert_eq!(received.bytes, 11);
        assert_eq!(&out[..11], b"hello, pipe");

        let stats = endpoint.stats();
        assert_eq!(stats.bytes_written, 11);
        assert_eq!(stats.bytes_read, 11);
        assert!(stats.connected);
    }

    #[test]
    fn test_short_write_reports_accepted_bytes() {
        let backend = LoopbackBackend {
            wait_for_stop: true,
            ..Default::default()
        };
        let endpoint = spawn(PipeDirection::Input, 8, backend);

        let first = endpoint.write(b"0123456789");
        assert_eq!(first.bytes, 8);
        assert!(first.is_ok());
        assert_eq!(endpoint.buffer_free().bytes, 0);
        assert_eq!(endpoint.write(b"x").bytes, 0);
    }

    #[test]
    fn test_connect_failure_is_terminal() {
        let backend = LoopbackBackend {
            refuse_connect: true,
            ..Default::default()
        };
        let endpoint = spawn(PipeDirection::Input, 16, backend);

        assert!(wait_until(Duration::from_secs(2), || !endpoint.is_running()));
        assert_eq!(endpoint.status(), PipeStatus::ConnectError);
        assert!(endpoint.error().unwrap().contains("connect failed"));
        assert_eq!(endpoint.write(b"data"), Transfer::new(0, PipeStatus::ConnectError));
    }

    #[test]
    fn test_force_close_while_connecting_reports_connect_error() {
        let backend = LoopbackBackend {
            wait_for_stop: true,
            ..Default::default()
        };
        let endpoint = spawn(PipeDirection::Input, 16, backend);
        thread::sleep(Duration::from_millis(10));

        endpoint.force_close(PipeStatus::Timeout);
        assert_eq!(endpoint.status(), PipeStatus::ConnectError);
        assert!(!endpoint.is_running());
    }

    #[test]
    fn test_force_close_connected_pipe_reports_timeout() {
        let endpoint = spawn(PipeDirection::Duplex, 16, LoopbackBackend::default());
        assert!(wait_until(Duration::from_secs(2), || endpoint.is_connected()));

        endpoint.force_close(PipeStatus::Timeout);
        assert_eq!(endpoint.status(), PipeStatus::Timeout);

        // The worker's own PipeClosed does not overwrite the timeout
        endpoint.close_thread();
        assert_eq!(endpoint.status(), PipeStatus::Timeout);
    }

    #[test]
    fn test_write_error_stops_worker() {
        let backend = LoopbackBackend {
            write_error: Some(io::ErrorKind::BrokenPipe),
            ..Default::default()
        };
        let endpoint = spawn(PipeDirection::Input, 16, backend);
        let _ = endpoint.write(b"doomed");

        assert!(wait_until(Duration::from_secs(2), || !endpoint.is_running()));
        assert_eq!(endpoint.status(), PipeStatus::WriteError);
        assert_eq!(endpoint.write(b"more").status, PipeStatus::WriteError);
    }

    #[test]
    fn test_broken_pipe_on_read_is_graceful_close() {
        let backend = LoopbackBackend {
            read_error: Some(io::ErrorKind::BrokenPipe),
            ..Default::default()
        };
        let endpoint = spawn(PipeDirection::Output, 16, backend);

        assert!(wait_until(Duration::from_secs(2), || !endpoint.is_running()));
        assert_eq!(endpoint.status(), PipeStatus::PipeClosed);
        assert!(!endpoint.status().is_error());
    }

    #[test]
    fn test_read_error_is_terminal() {
        let backend = LoopbackBackend {
            read_error: Some(io::ErrorKind::PermissionDenied),
            ..Default::default()
        };
        let endpoint = spawn(PipeDirection::Output, 16, backend);

        assert!(wait_until(Duration::from_secs(2), || !endpoint.is_running()));
        assert_eq!(endpoint.status(), PipeStatus::ReadError);
    }

    #[test]
    fn test_close_when_drained_waits_for_buffers() {
        let endpoint = spawn(PipeDirection::Duplex, 64, LoopbackBackend::default());
        let _ = endpoint.write(b"last words");
        endpoint.close_when_drained();

        // Looped-back bytes sit in the output ring until the caller reads them
        assert!(wait_until(Duration::from_secs(2), || endpoint
            .data_ready()
            .bytes
            == 10));
        assert!(endpoint.is_running());

        let mut out = [0u8; 16];
        assert_eq!(endpoint.read(&mut out).bytes, 10);
        assert!(wait_until(Duration::from_secs(2), || !endpoint.is_running()));
        assert_eq!(endpoint.status(), PipeStatus::PipeClosed);
    }

    #[test]
    fn test_idle_accumulator_is_bounded_by_real_idle_time() {
        let backend = LoopbackBackend {
            wait_for_stop: true,
            ..Default::default()
        };
        let endpoint = spawn(PipeDirection::Input, 16, backend);
        thread::sleep(Duration::from_millis(30));

        let idle = endpoint.add_idle(Duration::from_secs(10));
        assert!(idle >= 30.0);
        assert!(idle < 10_000.0);
        assert_eq!(endpoint.idle_ms(), idle);
    }

    #[test]
    fn test_idle_accumulator_resets_on_transfer() {
        let endpoint = spawn(PipeDirection::Duplex, 64, LoopbackBackend::default());
        assert!(wait_until(Duration::from_secs(2), || endpoint.is_connected()));
        thread::sleep(Duration::from_millis(20));
        assert!(endpoint.add_idle(Duration::from_millis(20)) >= 20.0);

        let _ = endpoint.write(b"activity");
        assert!(wait_until(Duration::from_secs(2), || endpoint.idle_ms() == 0.0));
        assert!(endpoint.add_idle(Duration::from_secs(1)) < 1000.0);
    }

    #[test]
    fn test_close_thread_is_idempotent() {
        let endpoint = spawn(PipeDirection::Output, 16, LoopbackBackend::default());
        endpoint.close_thread();
        endpoint.close_thread();
        assert!(!endpoint.is_running());
        assert_eq!(endpoint.status(), PipeStatus::PipeClosed);
    }
}
