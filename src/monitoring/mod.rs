/*!
 * Monitoring
 * Tracing subscriber setup for hosts that do not install their own
 */

mod tracer;

pub use tracer::{init_tracing, span_pipe_operation, TRACE_JSON_ENV};
