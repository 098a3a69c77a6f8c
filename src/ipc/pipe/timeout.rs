/*!
 * Timeout-aware Pipe Operations
 *
 * `write_to_pipe` accepts short writes and `read_from_pipe` returns whatever
 * has arrived. These helpers wrap both in the retry loop callers are
 * expected to run: resubmit the remainder right away after partial
 * progress, sleep `PIPE_RETRY_BACKOFF` after a call that moved nothing, and
 * give up on the first terminal status or when the deadline passes.
 */

use super::manager::PipingManager;
use super::types::{PipeError, PipeResult, PipeStatus};
use crate::core::limits::{PIPE_READ_CHUNK, PIPE_RETRY_BACKOFF};
use crate::core::types::{PipeId, Size};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Blocking pipe operations with optional deadlines
#[derive(Debug, Clone)]
pub struct TimeoutPipeOps {
    manager: Arc<PipingManager>,
}

impl TimeoutPipeOps {
    pub fn new(manager: Arc<PipingManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<PipingManager> {
        &self.manager
    }

    /// Queue all of `data`, retrying short writes
    ///
    /// `None` waits as long as the pipe stays `Ok`; the supervisor's idle
    /// timeout still bounds that wait.
    pub fn write_all(
        &self,
        pipe_id: PipeId,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> PipeResult<Size> {
        let start = Instant::now();
        let mut written = 0;

        while written < data.len() {
            let transfer = self.manager.write_to_pipe(pipe_id, &data[written..])?;
            if !transfer.is_ok() {
                return Err(PipeError::Status {
                    id: pipe_id,
                    status: transfer.status,
                });
            }
            written += transfer.bytes;

            if transfer.bytes == 0 {
                if expired(start, timeout) {
                    return Err(PipeError::WriteTimeout {
                        id: pipe_id,
                        elapsed_ms: elapsed_ms(start),
                        written,
                    });
                }
                thread::sleep(PIPE_RETRY_BACKOFF);
            }
        }

        Ok(written)
    }

    /// Read until the pipe has closed gracefully and nothing is left buffered
    pub fn drain(&self, pipe_id: PipeId, timeout: Option<Duration>) -> PipeResult<Vec<u8>> {
        let start = Instant::now();
        let mut chunk = vec![0u8; PIPE_READ_CHUNK];
        let mut received = Vec::new();

        loop {
            let transfer = self.manager.read_from_pipe(pipe_id, &mut chunk)?;
            if transfer.bytes > 0 {
                received.extend_from_slice(&chunk[..transfer.bytes]);
                continue;
            }

            match transfer.status {
                PipeStatus::Ok => {}
                PipeStatus::PipeClosed => return Ok(received),
                status => return Err(PipeError::Status { id: pipe_id, status }),
            }

            if expired(start, timeout) {
                return Err(PipeError::ReadTimeout {
                    id: pipe_id,
                    elapsed_ms: elapsed_ms(start),
                    read: received.len(),
                });
            }
            thread::sleep(PIPE_RETRY_BACKOFF);
        }
    }
}

fn expired(start: Instant, timeout: Option<Duration>) -> bool {
    timeout.is_some_and(|timeout| start.elapsed() >= timeout)
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_pipe_is_reported_immediately() {
        let ops = TimeoutPipeOps::new(Arc::new(PipingManager::new()));
        let err = ops
            .write_all(42, b"data", Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, PipeError::NotFound(42)));

        let err = ops.drain(42, None).unwrap_err();
        assert_eq!(err.status(), PipeStatus::PipeNotFound);
    }

    #[test]
    fn test_empty_write_needs_no_pipe_activity() {
        let ops = TimeoutPipeOps::new(Arc::new(PipingManager::new()));
        assert_eq!(ops.write_all(0, b"", Some(Duration::ZERO)).unwrap(), 0);
    }

    #[test]
    fn test_expired() {
        let start = Instant::now();
        assert!(!expired(start, None));
        assert!(expired(start, Some(Duration::ZERO)));
        assert!(!expired(start, Some(Duration::from_secs(60))));
    }
}
