/*!
 * Piping Configuration
 * Timeout, buffer size and timeout mode for a piping manager
 */

use crate::core::limits::{DEFAULT_PIPE_BUFFER, DEFAULT_PIPE_TIMEOUT};
use crate::core::types::Size;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Idle timeout in milliseconds
pub const ENV_TIMEOUT_MS: &str = "PIPE_MGR_TIMEOUT_MS";
/// Per-pipe ring buffer capacity in bytes
pub const ENV_MAXBUF: &str = "PIPE_MGR_MAXBUF";
/// `true`/`false`/`1`/`0`
pub const ENV_GLOBAL_TIMEOUT: &str = "PIPE_MGR_GLOBAL_TIMEOUT";

/// Manager configuration
///
/// `maxbuf` only applies to pipes created after it is set. `timeout` and
/// `global_timeout` are read by the supervisor on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipingConfig {
    /// Idle time before the supervisor force-closes a pipe
    pub timeout: Duration,
    /// Capacity of each ring buffer of a new pipe
    pub maxbuf: Size,
    /// Close everything only once every pipe is idle
    pub global_timeout: bool,
}

impl Default for PipingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PipingConfig {
    pub const fn new() -> Self {
        Self {
            timeout: DEFAULT_PIPE_TIMEOUT,
            maxbuf: DEFAULT_PIPE_BUFFER,
            global_timeout: true,
        }
    }

    /// Defaults overlaid with `PIPE_MGR_*` environment variables
    pub fn from_env() -> Self {
        Self::new().overlay(|key| env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = parse_var::<u64>(ENV_TIMEOUT_MS, &lookup) {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(maxbuf) = parse_var::<Size>(ENV_MAXBUF, &lookup) {
            self.maxbuf = maxbuf;
        }
        if let Some(raw) = lookup(ENV_GLOBAL_TIMEOUT) {
            match parse_bool(&raw) {
                Some(global) => self.global_timeout = global,
                None => warn!(var = ENV_GLOBAL_TIMEOUT, value = %raw, "Ignoring unparsable value"),
            }
        }
        self
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub const fn with_maxbuf(mut self, maxbuf: Size) -> Self {
        self.maxbuf = maxbuf;
        self
    }

    pub const fn with_global_timeout(mut self, global_timeout: bool) -> Self {
        self.global_timeout = global_timeout;
        self
    }
}

fn parse_var<T: FromStr>(key: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = key, value = %raw, "Ignoring unparsable value");
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
