//! Debugger core shared by the script host and a debug adapter.
//!
//! The host thread offers every statement to [`DebuggerCore`] through the
//! [`HostBridge`] hook and blocks there while the core is stopped. Control
//! requests from another thread release it again.
mod bridge;
mod control;
mod sync;

pub use bridge::{Backtrace, Frame, HostBridge, StopSnapshot, Variables, normalize_source_path};
pub use control::{
    DebuggerCore, DebuggerEvent, DebuggerHandler, DefaultDebuggerHandler, ExecutionState, PauseAction, StepKind,
};
pub use sync::{Gate, GateGuard, Gated, Latch};
