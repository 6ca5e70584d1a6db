//! Single-writer async runtime, event stream and service wiring.

/// Event stream types emitted by the runtime.
pub mod events;
/// Handle and command loop implementation.
pub mod handle;
/// Startup and shutdown of the whole subsystem.
pub mod service;
