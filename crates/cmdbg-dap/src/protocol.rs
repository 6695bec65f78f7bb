use std::sync::atomic::{AtomicBool, Ordering};

use cmdbg_lang::Latch;
use serde::{Deserialize, Serialize};

/// The only thread the client ever sees.
pub const THREAD_ID: i64 = 100;
/// Every stack frame shares this id; scopes always describe the top frame.
pub const FRAME_ID: i64 = 200;
pub const LOCALS_REFERENCE: i64 = 1;
pub const CACHE_REFERENCE: i64 = 2;
pub const SOURCE_REFERENCE: i64 = 400;

pub const LOCALS_SCOPE: &str = "Locals";
pub const CACHE_SCOPE: &str = "Cache Variable";

/// Launch arguments for DAP launch configuration
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArgs {
    pub stop_on_entry: Option<bool>,
}

/// What the request loop does after a request has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Disconnect { terminate_debuggee: bool },
}

/// Launch settings shared between the request loop and the host thread.
///
/// The host thread blocks in [`LaunchState::wait_configured`] until the
/// client sends `configurationDone`.
#[derive(Debug)]
pub struct LaunchState {
    configured: Latch,
    stop_on_entry: AtomicBool,
}

impl Default for LaunchState {
    fn default() -> Self {
        Self {
            configured: Latch::new(),
            stop_on_entry: AtomicBool::new(true),
        }
    }
}

impl LaunchState {
    pub fn apply(&self, args: &LaunchArgs) {
        if let Some(stop_on_entry) = args.stop_on_entry {
            self.stop_on_entry.store(stop_on_entry, Ordering::SeqCst);
        }
    }

    pub fn stop_on_entry(&self) -> bool {
        self.stop_on_entry.load(Ordering::SeqCst)
    }

    pub fn configure(&self) {
        self.configured.fire();
    }

    pub fn is_configured(&self) -> bool {
        self.configured.is_fired()
    }

    pub fn wait_configured(&self) {
        self.configured.wait();
    }
}
