use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use cmdbg_lang::DebuggerHandler;
use dap::prelude::*;
use dap::server::ServerOutput;
use tracing::{debug, warn};

use crate::protocol::THREAD_ID;

pub type SharedOutput<W> = Arc<Mutex<ServerOutput<W>>>;

/// Writes DAP events from any thread through the server's shared output.
///
/// Also the [`DebuggerHandler`] of the session's debugger core, turning
/// every stop into a `stopped` event.
pub struct DapEventSender<W: Write> {
    output: SharedOutput<W>,
}

impl<W: Write> Clone for DapEventSender<W> {
    fn clone(&self) -> Self {
        Self {
            output: Arc::clone(&self.output),
        }
    }
}

impl<W: Write> fmt::Debug for DapEventSender<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DapEventSender").finish_non_exhaustive()
    }
}

impl<W: Write> DapEventSender<W> {
    pub fn new(output: SharedOutput<W>) -> Self {
        Self { output }
    }

    pub fn send(&self, event: Event) {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = output.send_event(event) {
            warn!(error = %e, "Failed to send event");
        }
    }

    pub fn thread_started(&self) {
        self.send(Event::Thread(events::ThreadEventBody {
            reason: types::ThreadEventReason::Started,
            thread_id: THREAD_ID,
        }));
    }

    pub fn exited(&self, exit_code: i64) {
        self.send(Event::Exited(events::ExitedEventBody { exit_code }));
    }

    pub fn terminated(&self) {
        self.send(Event::Terminated(None));
    }

    pub fn output(&self, category: types::OutputEventCategory, message: &str) {
        let mut output = message.to_string();
        if !output.ends_with('\n') {
            output.push('\n');
        }

        self.send(Event::Output(events::OutputEventBody {
            output,
            category: Some(category),
            group: None,
            variables_reference: None,
            source: None,
            line: None,
            column: None,
            data: None,
        }));
    }

    fn stopped(&self, reason: types::StoppedEventReason, description: String) {
        self.send(Event::Stopped(events::StoppedEventBody {
            reason,
            description: Some(description),
            thread_id: Some(THREAD_ID),
            preserve_focus_hint: None,
            text: None,
            all_threads_stopped: Some(true),
            hit_breakpoint_ids: None,
        }));
    }
}

impl<W: Write + Send> DebuggerHandler for DapEventSender<W> {
    fn on_breakpoint_hit(&self, source: &Path, line: i64) {
        debug!(source = %source.display(), line, "Sending stopped event for breakpoint");
        self.stopped(
            types::StoppedEventReason::Breakpoint,
            format!("Breakpoint hit at line {line}"),
        );
    }

    fn on_step(&self, source: &Path, line: i64) {
        debug!(source = %source.display(), line, "Sending stopped event for step");
        self.stopped(
            types::StoppedEventReason::Step,
            format!("Step completed at line {line}"),
        );
    }

    fn on_pause(&self, source: &Path, line: i64) {
        debug!(source = %source.display(), line, "Sending stopped event for pause");
        self.stopped(
            types::StoppedEventReason::Pause,
            format!("Paused at line {line}"),
        );
    }
}
