/*!
 * Pipe Supervisor
 * Background thread that accumulates idle time and force-closes pipes
 * that stopped moving bytes
 */

use super::endpoint::PipeEndpoint;
use super::manager::ManagerState;
use super::types::PipeStatus;
use crate::core::limits::SUPERVISOR_INTERVAL;
use flume::{Receiver, RecvTimeoutError, Sender};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

/// Control messages for the supervisor thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorCommand {
    /// Sweep now instead of waiting for the next tick
    Trigger,
    Shutdown,
}

/// Handle to the supervisor thread
///
/// `shutdown` joins the thread and is idempotent. Dropping the handle shuts
/// it down too.
#[derive(Debug)]
pub(crate) struct Supervisor {
    command_tx: Sender<SupervisorCommand>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub(crate) fn spawn(state: Arc<ManagerState>) -> io::Result<Self> {
        let (command_tx, command_rx) = flume::unbounded();
        let handle = thread::Builder::new()
            .name("pipe-supervisor".to_string())
            .spawn(move || run_supervisor(state, command_rx, SUPERVISOR_INTERVAL))?;

        Ok(Self {
            command_tx,
            handle: Some(handle),
        })
    }

    pub(crate) fn trigger(&self) {
        let _ = self.command_tx.send(SupervisorCommand::Trigger);
    }

    pub(crate) fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.command_tx.send(SupervisorCommand::Shutdown);
        if handle.join().is_err() {
            warn!("Pipe supervisor thread panicked");
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_supervisor(
    state: Arc<ManagerState>,
    command_rx: Receiver<SupervisorCommand>,
    interval: Duration,
) {
    let span = info_span!("pipe_supervisor");
    let _entered = span.enter();

    state.supervisor_running.store(true, Ordering::Release);
    info!(interval_ms = interval.as_millis() as u64, "Pipe supervisor started");

    let mut last = Instant::now();
    loop {
        match command_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) | Ok(SupervisorCommand::Trigger) => {}
            Ok(SupervisorCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        let expired = sweep(&state, now.duration_since(last));
        last = now;

        // Closing joins worker threads, so it happens without the map lock
        for endpoint in expired {
            endpoint.force_close(PipeStatus::Timeout);
        }
    }

    state.supervisor_running.store(false, Ordering::Release);
    info!("Pipe supervisor stopped");
}

/// One supervisor tick: charge `elapsed` to every live pipe and pick the
/// ones to force-close
///
/// Per-pipe mode closes each pipe whose idle time reached the timeout. In
/// both modes, once no live pipe is below the timeout every pipe that has
/// not closed gracefully is closed.
pub(crate) fn sweep(state: &ManagerState, elapsed: Duration) -> Vec<Arc<PipeEndpoint>> {
    let timeout_ms = state.timeout().as_secs_f64() * 1000.0;
    let global = state.global_timeout();
    let pipes = state.pipes.lock();

    let mut expired = Vec::new();
    let mut active = false;
    for endpoint in pipes.values() {
        if endpoint.status().is_terminal() {
            continue;
        }
        let idle_ms = endpoint.add_idle(elapsed);
        if idle_ms < timeout_ms {
            active = true;
        } else if !global {
            debug!(pipe_id = endpoint.id(), idle_ms, "Pipe idle past timeout");
            expired.push(Arc::clone(endpoint));
        }
    }

    if !active {
        expired = pipes
            .values()
            .filter(|endpoint| {
                endpoint.status() != PipeStatus::PipeClosed && endpoint.is_running()
            })
            .cloned()
            .collect();
        if !expired.is_empty() {
            info!(pipes = expired.len(), timeout_ms, "No pipe activity, closing all pipes");
        }
    }

    expired
}
