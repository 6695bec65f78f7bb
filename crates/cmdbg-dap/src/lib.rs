//! Debug Adapter Protocol server for list-file scripts.
//!
//! The adapter speaks DAP over stdin/stdout and runs the script on a host
//! thread that stops at breakpoints, steps and pause requests through a
//! [`cmdbg_lang::DebuggerCore`].
pub mod adapter;
pub mod error;
pub mod handler;
pub mod log;
pub mod protocol;
pub mod server;
pub mod transport;

#[cfg(test)]
mod testing;

pub use server::{ServerOptions, SessionEnd, run_session, serve, start};
