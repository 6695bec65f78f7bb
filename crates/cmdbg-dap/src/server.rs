use std::borrow::Cow;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use cmdbg_lang::{DebuggerCore, Evaluator, normalize_source_path};
use crossbeam_channel::Receiver;
use dap::errors::ServerError;
use dap::prelude::*;
use dap::responses::{Response, ResponseMessage};
use dap::types::OutputEventCategory;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapter::{DapAdapter, DynResult};
use crate::error::AdapterError;
use crate::handler::DapEventSender;
use crate::log::{self, DebugConsoleWriter};
use crate::protocol::{LaunchState, SessionControl};
use crate::transport::{FrameReader, LastFrame, Spy, TrafficLog};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "CMDBG_LOG";

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub script: PathBuf,
    pub trace_file: Option<PathBuf>,
    /// Filter used when [`LOG_ENV`] is unset.
    pub log_level: String,
}

/// How a debug session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the stream without a `disconnect` request.
    Closed,
    Disconnected { terminate_debuggee: bool },
}

/// Runs a debug session over stdin/stdout.
pub fn start(options: ServerOptions) -> DynResult<SessionEnd> {
    let (debug_writer, log_rx) = DebugConsoleWriter::new();
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(&options.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(debug_writer)
        .init();

    info!(script = %options.script.display(), "Starting cmdbg-dap debug adapter");

    let traffic = match &options.trace_file {
        Some(path) => TrafficLog::create(path)?,
        None => TrafficLog::disabled(),
    };
    let reader = Spy::new(io::stdin(), traffic.clone());
    let writer = Spy::new(io::stdout(), traffic.clone());

    let end = run_session(reader, writer, options.script, Some(log_rx), |reason| {
        traffic.close(reason)
    });
    traffic.close("session finished");
    end
}

/// Wires the adapter, the debugger core and the script host together and
/// serves requests until the client goes away.
///
/// The host thread waits for `configurationDone` before it runs `script`.
/// Returns once the host has finished, except when the client asked for the
/// debuggee to be terminated.
pub fn run_session<R, W>(
    reader: R,
    writer: W,
    script: PathBuf,
    log_rx: Option<Receiver<String>>,
    on_transport_error: impl FnMut(&str),
) -> DynResult<SessionEnd>
where
    R: Read,
    W: Write + Send + 'static,
{
    let last_frame = LastFrame::default();
    let reader = FrameReader::new(reader, last_frame.clone());
    let server = Server::new(BufReader::new(reader), BufWriter::new(writer));
    let events = DapEventSender::new(Arc::clone(&server.output));
    let core = Arc::new(DebuggerCore::with_handler(Box::new(events.clone())));
    let launch = Arc::new(LaunchState::default());

    register_script(&core, &script);

    if let Some(log_rx) = log_rx {
        log::spawn_forwarder(log_rx, events.clone())?;
    }

    let host = {
        let core = Arc::clone(&core);
        let launch = Arc::clone(&launch);
        thread::Builder::new()
            .name("cmdbg-host".to_string())
            .spawn(move || run_host(&script, &core, &launch, &events))?
    };

    let adapter = DapAdapter::new(Arc::clone(&core), Arc::clone(&launch));
    let end = serve(server, adapter, &last_frame, on_transport_error);

    // Nobody can release the host any more.
    launch.configure();
    core.detach();

    if let Ok(SessionEnd::Disconnected {
        terminate_debuggee: true,
    }) = end
    {
        return end;
    }

    match host.join() {
        Ok(exit_code) => debug!(exit_code, "Host thread finished"),
        Err(_) => error!("Host thread panicked"),
    }
    end
}

/// The request loop.
///
/// The first request must be `initialize`. `on_transport_error` runs for every
/// message that cannot be decoded. A request the protocol layer rejects is
/// answered with an error response, recovered from `last_frame`, and the loop
/// goes on; a broken stream ends it.
pub fn serve<R: Read, W: Write>(
    mut server: Server<R, W>,
    mut adapter: DapAdapter,
    last_frame: &LastFrame,
    mut on_transport_error: impl FnMut(&str),
) -> DynResult<SessionEnd> {
    let mut initialized = false;

    loop {
        let req = match server.poll_request() {
            Ok(Some(req)) => req,
            Ok(None) if !initialized => {
                return Err(Box::new(AdapterError::ProtocolError(Cow::Borrowed(
                    "Missing initialize request",
                ))));
            }
            Ok(None) => {
                info!("Client disconnected or stream ended");
                return Ok(SessionEnd::Closed);
            }
            Err(e @ ServerError::ParseError(_)) => {
                let message = e.to_string();
                warn!(error = %message, "Failed to parse DAP request");
                on_transport_error(&message);
                reject_frame(&mut server, last_frame.take())?;
                continue;
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "Failed to read DAP request");
                on_transport_error(&message);
                return Err(Box::new(AdapterError::Transport(message)));
            }
        };

        if !initialized {
            if !matches!(req.command, Command::Initialize(_)) {
                return Err(Box::new(AdapterError::ProtocolError(Cow::Borrowed(
                    "Expected initialize request",
                ))));
            }
            initialized = true;
        }

        match adapter.handle_request(req, &mut server) {
            Ok(SessionControl::Continue) => {}
            Ok(SessionControl::Disconnect { terminate_debuggee }) => {
                return Ok(SessionEnd::Disconnected { terminate_debuggee });
            }
            Err(e) => {
                error!(error = %e, "Failed to send DAP response");
                on_transport_error(&e.to_string());
                return Err(e);
            }
        }
    }
}

/// Answers a frame that did not parse as a request, if it carries a `seq`.
fn reject_frame<R: Read, W: Write>(
    server: &mut Server<R, W>,
    body: Option<Vec<u8>>,
) -> DynResult<()> {
    let Some(message) = body.and_then(|body| serde_json::from_slice::<Value>(&body).ok()) else {
        return Ok(());
    };
    let Some(request_seq) = message["seq"].as_i64() else {
        return Ok(());
    };

    let command = message["command"].as_str().unwrap_or("<missing>");
    let error = AdapterError::ProtocolError(Cow::Owned(format!(
        "Malformed or unsupported request: {command}"
    )));
    debug!(request_seq, command, "Rejecting request");
    server.respond(Response {
        request_seq,
        success: false,
        message: Some(ResponseMessage::Error(error.to_string())),
        body: None,
        error: None,
    })?;
    Ok(())
}

fn register_script(core: &DebuggerCore, script: &Path) {
    let path = normalize_source_path(script);
    match std::fs::read_to_string(&path) {
        Ok(source) => core.register_source(path, source.lines().count()),
        Err(e) => warn!(error = %e, path = %path.display(), "Failed to read script"),
    }
}

fn run_host<W>(
    script: &Path,
    core: &Arc<DebuggerCore>,
    launch: &LaunchState,
    events: &DapEventSender<W>,
) -> i64
where
    W: Write + Send + 'static,
{
    launch.wait_configured();
    if !core.is_active() {
        debug!("Session ended before configuration, not running the script");
        return 0;
    }

    events.thread_started();
    if launch.stop_on_entry() {
        core.request_pause();
    }

    let output = events.clone();
    let mut eval = Evaluator::new()
        .with_debugger(Arc::clone(core))
        .with_output(move |line| output.output(OutputEventCategory::Stdout, line));

    let exit_code = match eval.run_file(script) {
        Ok(()) => {
            info!("Script finished");
            0
        }
        Err(e) => {
            error!(error = %e, "Script failed");
            events.output(OutputEventCategory::Stderr, &e.to_string());
            1
        }
    };

    events.exited(exit_code);
    events.terminated();
    exit_code
}
