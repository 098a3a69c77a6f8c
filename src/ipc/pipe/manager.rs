/*!
 * Piping Manager
 * Registry of named pipe endpoints plus the idle-timeout supervisor
 */

use super::endpoint::PipeEndpoint;
use super::os::OsPipe;
use super::supervisor::Supervisor;
use super::types::{PipeDirection, PipeError, PipeResult, PipeStats, PipeStatus, Transfer};
use crate::config::PipingConfig;
use crate::core::types::{PipeId, Size};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// State shared by the manager handle and its supervisor thread
#[derive(Debug)]
pub(crate) struct ManagerState {
    pub(crate) pipes: Mutex<BTreeMap<PipeId, Arc<PipeEndpoint>>>,
    timeout_ms: AtomicU64,
    maxbuf: AtomicUsize,
    global_timeout: AtomicBool,
    pub(crate) supervisor_running: AtomicBool,
}

impl ManagerState {
    pub(crate) fn new(config: PipingConfig) -> Self {
        Self {
            pipes: Mutex::new(BTreeMap::new()),
            timeout_ms: AtomicU64::new(duration_ms(config.timeout)),
            maxbuf: AtomicUsize::new(config.maxbuf),
            global_timeout: AtomicBool::new(config.global_timeout),
            supervisor_running: AtomicBool::new(false),
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    pub(crate) fn global_timeout(&self) -> bool {
        self.global_timeout.load(Ordering::Acquire)
    }

    fn config(&self) -> PipingConfig {
        PipingConfig {
            timeout: self.timeout(),
            maxbuf: self.maxbuf.load(Ordering::Acquire),
            global_timeout: self.global_timeout(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Named pipe transport for one codec session
///
/// Each pipe gets its own worker thread; every method here only copies
/// between caller buffers and ring buffers, so callers never block on pipe
/// I/O. One supervisor thread per manager force-closes idle pipes.
pub struct PipingManager {
    state: Arc<ManagerState>,
    next_id: AtomicU32,
    supervisor: Mutex<Option<Supervisor>>,
    open: AtomicBool,
}

impl std::fmt::Debug for PipingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipingManager")
            .field("open", &self.is_open())
            .field("pipes", &self.pipe_count())
            .field("config", &self.config())
            .finish()
    }
}

impl Default for PipingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PipingManager {
    pub fn new() -> Self {
        Self::with_config(PipingConfig::default())
    }

    pub fn with_config(config: PipingConfig) -> Self {
        let state = Arc::new(ManagerState::new(config));
        let supervisor = match Supervisor::spawn(Arc::clone(&state)) {
            Ok(supervisor) => Some(supervisor),
            Err(e) => {
                warn!(error = %e, "Could not start pipe supervisor; idle pipes will not time out");
                None
            }
        };

        info!(
            timeout_ms = duration_ms(config.timeout),
            maxbuf = config.maxbuf,
            global_timeout = config.global_timeout,
            "Piping manager initialized"
        );

        Self {
            state,
            next_id: AtomicU32::new(0),
            supervisor: Mutex::new(supervisor),
            open: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> PipingConfig {
        self.state.config()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn pipe_count(&self) -> usize {
        self.state.pipes.lock().len()
    }

    /// Create the OS pipe at `path` and start its worker
    ///
    /// Ids increase monotonically and are never reused, even when creation
    /// fails after an id was drawn.
    pub fn create_named_pipe(
        &self,
        path: impl AsRef<Path>,
        direction: PipeDirection,
    ) -> PipeResult<PipeId> {
        if !self.is_open() {
            return Err(PipeError::ManagerClosed);
        }
        let path = path.as_ref();
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);

        let backend = OsPipe::create(path, direction).map_err(|source| {
            warn!(pipe_id = id, path = %path.display(), error = %source, "Pipe creation failed");
            PipeError::Create {
                path: path.display().to_string(),
                source,
            }
        })?;
        let os_path = backend.os_path();
        let capacity = self.state.maxbuf.load(Ordering::Acquire);

        let endpoint = Arc::new(PipeEndpoint::spawn(
            id,
            os_path.clone(),
            direction,
            capacity,
            backend,
        )?);

        // `close` clears `open` before it empties the map, so checking again
        // under the map lock means it either sees this pipe or we see it closed
        {
            let mut pipes = self.state.pipes.lock();
            if self.is_open() {
                pipes.insert(id, Arc::clone(&endpoint));
            } else {
                drop(pipes);
                endpoint.close_thread();
                return Err(PipeError::ManagerClosed);
            }
        }

        info!(
            pipe_id = id,
            path = %os_path,
            direction = %direction,
            capacity,
            "Named pipe created"
        );
        Ok(id)
    }

    /// Stop the worker synchronously and forget the pipe
    pub fn destroy_named_pipe(&self, id: PipeId) -> PipeResult<()> {
        let endpoint = self
            .state
            .pipes
            .lock()
            .remove(&id)
            .ok_or(PipeError::NotFound(id))?;

        // Outside the map lock so other pipes stay usable while the worker exits
        endpoint.close_thread();
        info!(pipe_id = id, status = %endpoint.status(), "Named pipe destroyed");
        Ok(())
    }

    /// Let the worker exit once both buffers are empty. Does not block.
    pub fn close_pipe(&self, id: PipeId) -> PipeResult<()> {
        let endpoint = self.endpoint(id)?;
        endpoint.close_when_drained();
        info!(pipe_id = id, "Pipe close requested");
        Ok(())
    }

    pub fn get_pipe_path(&self, id: PipeId) -> PipeResult<String> {
        Ok(self.endpoint(id)?.path().to_string())
    }

    /// Queue as much of `data` as fits; a short count is backpressure
    pub fn write_to_pipe(&self, id: PipeId, data: &[u8]) -> PipeResult<Transfer> {
        Ok(self.endpoint(id)?.write(data))
    }

    /// Copy out whatever already arrived, up to `buf.len()` bytes
    pub fn read_from_pipe(&self, id: PipeId, buf: &mut [u8]) -> PipeResult<Transfer> {
        Ok(self.endpoint(id)?.read(buf))
    }

    pub fn pipe_data_ready(&self, id: PipeId) -> PipeResult<Transfer> {
        Ok(self.endpoint(id)?.data_ready())
    }

    pub fn pipe_buffer_free(&self, id: PipeId) -> PipeResult<Transfer> {
        Ok(self.endpoint(id)?.buffer_free())
    }

    /// Status of a pipe, `PipeNotFound` for unknown ids
    pub fn get_pipe_status(&self, id: PipeId) -> PipeStatus {
        self.endpoint(id)
            .map(|endpoint| endpoint.status())
            .unwrap_or_else(|e| e.status())
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.state
            .timeout_ms
            .store(duration_ms(timeout), Ordering::Release);
        self.recheck_timeouts();
    }

    /// Ring capacity for pipes created from now on
    pub fn set_maxbuf(&self, maxbuf: Size) {
        self.state.maxbuf.store(maxbuf, Ordering::Release);
    }

    pub fn set_global_timeout(&self, global_timeout: bool) {
        self.state
            .global_timeout
            .store(global_timeout, Ordering::Release);
        self.recheck_timeouts();
    }

    /// Have the supervisor apply the current timeout settings without waiting a full tick
    fn recheck_timeouts(&self) {
        if let Some(supervisor) = self.supervisor.lock().as_ref() {
            supervisor.trigger();
        }
    }

    pub fn stats(&self, id: PipeId) -> PipeResult<PipeStats> {
        Ok(self.endpoint(id)?.stats())
    }

    /// Statistics for every registered pipe, in id order
    pub fn snapshot(&self) -> Vec<PipeStats> {
        self.state
            .pipes
            .lock()
            .values()
            .map(|endpoint| endpoint.stats())
            .collect()
    }

    /// Human-readable dump for logs
    pub fn print_internal_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Supervisor running: {}",
            self.state.supervisor_running.load(Ordering::Acquire)
        );
        for stats in self.snapshot() {
            let _ = writeln!(out, "Pipe {} ({}): {}", stats.id, stats.direction, stats.path);
            let _ = writeln!(out, "  Running: {}", stats.running);
            let _ = writeln!(out, "  Status: {}", stats.status);
            let _ = writeln!(
                out,
                "  In buffer: {}/{}",
                stats.input_buffered, stats.input_capacity
            );
            let _ = writeln!(
                out,
                "  Out buffer: {}/{}",
                stats.output_buffered, stats.output_capacity
            );
            let _ = writeln!(out, "  Idle: {:.0}ms", stats.idle_ms);
            if let Some(error) = stats.error {
                let _ = writeln!(out, "  Error: {}", error);
            }
        }
        out
    }

    /// Stop the supervisor, then every worker. Idempotent.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(mut supervisor) = self.supervisor.lock().take() {
            supervisor.shutdown();
        }

        let pipes = std::mem::take(&mut *self.state.pipes.lock());
        let count = pipes.len();
        for endpoint in pipes.into_values() {
            endpoint.close_thread();
        }
        info!(pipes = count, "Piping manager closed");
    }

    fn endpoint(&self, id: PipeId) -> PipeResult<Arc<PipeEndpoint>> {
        if !self.is_open() {
            return Err(PipeError::ManagerClosed);
        }
        self.state
            .pipes
            .lock()
            .get(&id)
            .cloned()
            .ok_or(PipeError::NotFound(id))
    }
}

impl Drop for PipingManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_id_reports_not_found() {
        let manager = PipingManager::new();
        assert!(matches!(
            manager.destroy_named_pipe(7),
            Err(PipeError::NotFound(7))
        ));
        assert!(matches!(manager.close_pipe(7), Err(PipeError::NotFound(7))));
        assert_eq!(manager.get_pipe_status(7), PipeStatus::PipeNotFound);
        assert!(manager.write_to_pipe(7, b"x").is_err());
        let mut buf = [0u8; 4];
        assert!(manager.read_from_pipe(7, &mut buf).is_err());
    }

    #[test]
    fn test_setters_update_config() {
        let manager = PipingManager::new();
        manager.set_timeout(Duration::from_millis(750));
        manager.set_maxbuf(4096);
        manager.set_global_timeout(false);

        let config = manager.config();
        assert_eq!(config.timeout, Duration::from_millis(750));
        assert_eq!(config.maxbuf, 4096);
        assert!(!config.global_timeout);
    }

    #[test]
    fn test_close_is_idempotent() {
        let manager = PipingManager::with_config(PipingConfig::new().with_maxbuf(64));
        manager.close();
        manager.close();
        assert!(!manager.is_open());
        assert!(matches!(
            manager.create_named_pipe("/nonexistent/pipe", PipeDirection::Input),
            Err(PipeError::ManagerClosed)
        ));
        assert_eq!(manager.get_pipe_status(0), PipeStatus::PipeNotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_create_consumes_id_without_registering() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PipingManager::new();

        let missing = dir.path().join("missing").join("pipe");
        let err = manager
            .create_named_pipe(&missing, PipeDirection::Output)
            .unwrap_err();
        assert_eq!(err.status(), PipeStatus::CreateError);
        assert_eq!(manager.pipe_count(), 0);

        let id = manager
            .create_named_pipe(dir.path().join("ok"), PipeDirection::Duplex)
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(manager.pipe_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_close_racing_create_leaves_no_pipes() {
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        for round in 0..50 {
            let manager = Arc::new(PipingManager::with_config(
                PipingConfig::new().with_maxbuf(64),
            ));
            let creator = {
                let manager = Arc::clone(&manager);
                let base = dir.path().join(format!("race-{}", round));
                thread::spawn(move || {
                    let mut created = Vec::new();
                    for n in 0.. {
                        match manager.create_named_pipe(
                            base.with_extension(n.to_string()),
                            PipeDirection::Duplex,
                        ) {
                            Ok(id) => created.push(id),
                            Err(PipeError::ManagerClosed) => break,
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                    created
                })
            };

            thread::sleep(Duration::from_millis(2));
            manager.close();
            assert_eq!(manager.pipe_count(), 0, "round {}", round);

            let created = creator.join().unwrap();
            assert_eq!(manager.pipe_count(), 0, "round {}", round);
            assert!(created.iter().all(|&id| manager.stats(id).is_err()));
        }
    }

    #[test]
    fn test_internal_state_dump_mentions_supervisor() {
        let manager = PipingManager::new();
        let dump = manager.print_internal_state();
        assert!(dump.starts_with("Supervisor running:"));
    }
}
