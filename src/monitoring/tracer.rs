/*!
 * Tracing Setup
 * Structured logs for pipe workers and the supervisor using the tracing crate
 *
 * Worker threads log inside a `pipe_worker` span carrying `pipe_id` and
 * `path`, the supervisor inside `pipe_supervisor`, so every line can be
 * attributed to one pipe.
 */

use tracing::{info, span, Level, Span};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::core::types::PipeId;

/// Set to `1` or `true` for JSON output
pub const TRACE_JSON_ENV: &str = "PIPE_TRACE_JSON";

/// Install a global subscriber
///
/// Environment variables:
/// - RUST_LOG: log filter (default: info)
/// - PIPE_TRACE_JSON: JSON output (default: false)
///
/// Returns `false` when a global subscriber was already installed, which
/// makes repeated calls harmless.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var(TRACE_JSON_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Pipe tracing initialized");
    }
    installed
}

/// Span for a caller-side operation on one pipe, e.g. a codec's flush
pub fn span_pipe_operation(operation: &str, pipe_id: PipeId) -> Span {
    span!(Level::DEBUG, "pipe_op", operation, pipe_id)
}
