/*!
 * Core Types
 * Common types used across the transport
 */

/// Pipe identifier, assigned monotonically by a manager and never reused
pub type PipeId = u32;

/// Size type for buffer operations
pub type Size = usize;

/// Idle time in milliseconds (fractional)
pub type IdleMillis = f64;
