/*!
 * Pipe Types
 * Status taxonomy, directions, errors and statistics for named pipes
 */

use crate::core::types::{IdleMillis, PipeId, Size};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for manager operations
pub type PipeResult<T> = Result<T, PipeError>;

/// Flat pipe status
///
/// Every value other than `Ok` is terminal for an endpoint. `PipeNotFound`
/// is synthesized by the manager and never stored on an endpoint.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeStatus {
    Ok = 0,
    Timeout = 1,
    ConnectError = 2,
    ReadError = 3,
    WriteError = 4,
    CreateError = 5,
    PipeNotFound = 6,
    PipeClosed = 7,
    UnknownError = 8,
    BufferFull = 9,
}

impl PipeStatus {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a stored status. Unknown values decode as `UnknownError`.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Timeout,
            2 => Self::ConnectError,
            3 => Self::ReadError,
            4 => Self::WriteError,
            5 => Self::CreateError,
            6 => Self::PipeNotFound,
            7 => Self::PipeClosed,
            9 => Self::BufferFull,
            _ => Self::UnknownError,
        }
    }

    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// No further OS transfer happens once a pipe reaches a terminal status
    #[inline]
    pub const fn is_terminal(self) -> bool {
        !self.is_ok()
    }

    /// Terminal and not the graceful `PipeClosed` end state
    #[inline]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Ok | Self::PipeClosed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Timeout => "timeout",
            Self::ConnectError => "connect-error",
            Self::ReadError => "read-error",
            Self::WriteError => "write-error",
            Self::CreateError => "create-error",
            Self::PipeNotFound => "pipe-not-found",
            Self::PipeClosed => "pipe-closed",
            Self::UnknownError => "unknown-error",
            Self::BufferFull => "buffer-full",
        }
    }
}

impl fmt::Display for PipeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a pipe, seen from the caller of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeDirection {
    /// Caller writes, remote process reads
    Input,
    /// Remote process writes, caller reads
    Output,
    /// Both
    Duplex,
}

impl PipeDirection {
    /// Whether the worker drains the input ring into the OS pipe
    #[inline]
    pub const fn writes_to_os(self) -> bool {
        matches!(self, Self::Input | Self::Duplex)
    }

    /// Whether the worker fills the output ring from the OS pipe
    #[inline]
    pub const fn reads_from_os(self) -> bool {
        matches!(self, Self::Output | Self::Duplex)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Duplex => "duplex",
        }
    }
}

impl fmt::Display for PipeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipe error types
#[derive(Debug, Error, Diagnostic)]
pub enum PipeError {
    #[error("Pipe not found: {0}")]
    #[diagnostic(
        code(pipe::not_found),
        help("The pipe id is unknown to this manager. It may already have been destroyed.")
    )]
    NotFound(PipeId),

    #[error("Failed to create pipe at {path}: {source}")]
    #[diagnostic(
        code(pipe::create),
        help("Check that the directory exists and that the pipe file can be deleted and recreated.")
    )]
    Create {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn worker for pipe {id}: {source}")]
    #[diagnostic(code(pipe::spawn))]
    Spawn {
        id: PipeId,
        #[source]
        source: io::Error,
    },

    #[error("Piping manager is closed")]
    #[diagnostic(
        code(pipe::manager_closed),
        help("close() releases every pipe. Create a new manager for a new session.")
    )]
    ManagerClosed,

    #[error("Pipe {id} is in state {status}")]
    #[diagnostic(code(pipe::status))]
    Status { id: PipeId, status: PipeStatus },

    #[error("Write to pipe {id} timed out after {elapsed_ms}ms ({written} bytes accepted)")]
    #[diagnostic(
        code(pipe::write_timeout),
        help("The remote process is not draining the pipe. Check that it is still running.")
    )]
    WriteTimeout {
        id: PipeId,
        elapsed_ms: u64,
        written: Size,
    },

    #[error("Read from pipe {id} timed out after {elapsed_ms}ms ({read} bytes received)")]
    #[diagnostic(code(pipe::read_timeout))]
    ReadTimeout {
        id: PipeId,
        elapsed_ms: u64,
        read: Size,
    },
}

impl PipeError {
    /// Map onto the flat status taxonomy
    pub fn status(&self) -> PipeStatus {
        match self {
            Self::NotFound(_) | Self::ManagerClosed => PipeStatus::PipeNotFound,
            Self::Create { .. } | Self::Spawn { .. } => PipeStatus::CreateError,
            Self::Status { status, .. } => *status,
            Self::WriteTimeout { .. } => PipeStatus::BufferFull,
            Self::ReadTimeout { .. } => PipeStatus::Timeout,
        }
    }
}

/// Byte count reported together with the endpoint status observed under
/// the same lock
///
/// For `write_to_pipe` `bytes` is the number accepted into the input ring
/// (a short count is backpressure, not an error). For `read_from_pipe` it
/// is the number copied out. For the buffer queries it is the fill level.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub bytes: Size,
    pub status: PipeStatus,
}

impl Transfer {
    pub const fn new(bytes: Size, status: PipeStatus) -> Self {
        Self { bytes, status }
    }

    #[inline]
    pub const fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

/// Pipe statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipeStats {
    pub id: PipeId,
    pub path: String,
    pub direction: PipeDirection,
    pub status: PipeStatus,
    pub running: bool,
    pub connected: bool,
    pub input_buffered: Size,
    pub input_capacity: Size,
    pub output_buffered: Size,
    pub output_capacity: Size,
    pub idle_ms: IdleMillis,
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub bytes_written: u64,
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub bytes_read: u64,
    #[serde(skip_serializing_if = "is_false", default)]
    pub close_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}
