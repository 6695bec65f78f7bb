//! `cmdbg-lang` provides a small list-file script host and the debugger core
//! that pauses it.
//!
//! ## Examples
//!
//! ```rs
//! use std::sync::Arc;
//! use cmdbg_lang::{DebuggerCore, Evaluator};
//!
//! let core = Arc::new(DebuggerCore::new());
//! core.set_breakpoints("CMakeLists.txt", &[2]);
//!
//! let mut eval = Evaluator::new().with_debugger(Arc::clone(&core));
//! // Blocks on line 2 until another thread calls `core.request_continue()`.
//! eval.run_file("CMakeLists.txt").unwrap();
//! ```
pub mod debugger;
mod error;
mod eval;
mod script;

pub use debugger::{
    Backtrace, DebuggerCore, DebuggerEvent, DebuggerHandler, DefaultDebuggerHandler,
    ExecutionState, Frame, HostBridge, Latch, PauseAction, StepKind, StopSnapshot, Variables,
    normalize_source_path,
};
pub use error::ScriptError;
pub use eval::{Evaluator, Options, OutputFn};
pub use script::{Argument, Command, ListFile, parse};
