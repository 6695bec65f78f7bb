use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cmdbg_lang::{DebuggerCore, StopSnapshot, Variables, normalize_source_path};
use dap::prelude::*;
use dap::requests::{SetBreakpointsArguments, SourceArguments};
use dap::responses::{
    ContinueResponse, ScopesResponse, SetBreakpointsResponse, SetExceptionBreakpointsResponse,
    SourceResponse, StackTraceResponse, ThreadsResponse, VariablesResponse,
};
use dap::types::Breakpoint;
use tracing::{debug, info, warn};

use crate::error::AdapterError;
use crate::protocol::{
    CACHE_REFERENCE, CACHE_SCOPE, FRAME_ID, LOCALS_REFERENCE, LOCALS_SCOPE, LaunchArgs,
    LaunchState, SOURCE_REFERENCE, SessionControl, THREAD_ID,
};

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Translates DAP requests into [`DebuggerCore`] calls.
pub struct DapAdapter {
    core: Arc<DebuggerCore>,
    launch: Arc<LaunchState>,
    /// Source text by normalized path, read at most once per session.
    sources: HashMap<PathBuf, String>,
}

impl DapAdapter {
    pub fn new(core: Arc<DebuggerCore>, launch: Arc<LaunchState>) -> Self {
        Self {
            core,
            launch,
            sources: HashMap::new(),
        }
    }

    /// Handle DAP request and send appropriate response
    ///
    /// Failures tied to a single request are answered with an error response;
    /// only transport failures are returned.
    pub fn handle_request(
        &mut self,
        req: Request,
        server: &mut Server<impl io::Read, impl io::Write>,
    ) -> DynResult<SessionControl> {
        match &req.command {
            Command::Initialize(args) => {
                debug!(client = ?args.client_name, "Received Initialize request");
                let capabilities = types::Capabilities {
                    supports_configuration_done_request: Some(true),
                    ..Default::default()
                };
                server.respond(req.success(ResponseBody::Initialize(capabilities)))?;
                server.send_event(Event::Initialized)?;
            }
            Command::ConfigurationDone => {
                debug!("Received ConfigurationDone request");
                server.respond(req.success(ResponseBody::ConfigurationDone))?;
                self.launch.configure();
            }
            Command::Disconnect(args) => {
                let terminate_debuggee = args.terminate_debuggee.unwrap_or(false);
                info!(terminate_debuggee, "Received Disconnect request");
                server.respond(req.success(ResponseBody::Disconnect))?;
                self.core.detach();
                return Ok(SessionControl::Disconnect { terminate_debuggee });
            }
            command => {
                let rsp = match self.reply(command) {
                    Ok(body) => req.success(body),
                    Err(e) => {
                        warn!(error = %e, "Failed to handle DAP request");
                        req.error(&e.to_string())
                    }
                };
                server.respond(rsp)?;
            }
        }

        Ok(SessionControl::Continue)
    }

    fn reply(&mut self, command: &Command) -> Result<ResponseBody, AdapterError> {
        match command {
            Command::Launch(args) => {
                if let Some(data) = &args.additional_data {
                    let launch: LaunchArgs = serde_json::from_value(data.clone())?;
                    debug!(?launch, "Received Launch request");
                    self.launch.apply(&launch);
                }
                Ok(ResponseBody::Launch)
            }
            Command::Attach(_) => {
                debug!("Received Attach request");
                Ok(ResponseBody::Attach)
            }
            Command::SetBreakpoints(args) => {
                debug!(?args, "Received SetBreakpoints request");
                Ok(ResponseBody::SetBreakpoints(SetBreakpointsResponse {
                    breakpoints: self.set_breakpoints(args),
                }))
            }
            Command::SetExceptionBreakpoints(_) => {
                debug!("Received SetExceptionBreakpoints request");
                Ok(ResponseBody::SetExceptionBreakpoints(
                    SetExceptionBreakpointsResponse { breakpoints: None },
                ))
            }
            Command::Threads => Ok(ResponseBody::Threads(ThreadsResponse {
                threads: vec![types::Thread {
                    id: THREAD_ID,
                    name: "main".to_string(),
                }],
            })),
            Command::StackTrace(args) => {
                debug!(?args, "Received StackTrace request");
                if args.thread_id != THREAD_ID {
                    return Err(AdapterError::UnknownThreadId(args.thread_id));
                }
                let stack_frames = stack_frames(&self.core.current_snapshot());
                Ok(ResponseBody::StackTrace(StackTraceResponse {
                    total_frames: Some(stack_frames.len() as i64),
                    stack_frames,
                }))
            }
            Command::Scopes(args) => {
                debug!(?args, "Received Scopes request");
                if args.frame_id != FRAME_ID {
                    return Err(AdapterError::UnknownFrameId(args.frame_id));
                }
                Ok(ResponseBody::Scopes(ScopesResponse {
                    scopes: vec![
                        scope(LOCALS_SCOPE, LOCALS_REFERENCE),
                        scope(CACHE_SCOPE, CACHE_REFERENCE),
                    ],
                }))
            }
            Command::Variables(args) => {
                debug!(?args, "Received Variables request");
                let snapshot = self.core.current_snapshot();
                let entries = match args.variables_reference {
                    LOCALS_REFERENCE => &snapshot.local_variables,
                    CACHE_REFERENCE => &snapshot.cache_entries,
                    other => return Err(AdapterError::UnknownVariablesReference(other)),
                };
                Ok(ResponseBody::Variables(VariablesResponse {
                    variables: variables(entries),
                }))
            }
            Command::Source(args) => {
                debug!(?args, "Received Source request");
                Ok(ResponseBody::Source(SourceResponse {
                    content: self.source_content(args)?,
                    mime_type: Some("text/x-cmake".to_string()),
                }))
            }
            Command::Pause(_) => {
                debug!("Received Pause request");
                self.core.request_pause();
                Ok(ResponseBody::Pause)
            }
            Command::Continue(_) => {
                debug!("Received Continue request");
                self.core.request_continue();
                Ok(ResponseBody::Continue(ContinueResponse {
                    all_threads_continued: Some(true),
                }))
            }
            Command::Next(_) => {
                debug!("Received Next request");
                self.core.request_step_over();
                Ok(ResponseBody::Next)
            }
            Command::StepIn(_) => {
                debug!("Received StepIn request");
                self.core.request_step_into();
                Ok(ResponseBody::StepIn)
            }
            Command::StepOut(_) => {
                debug!("Received StepOut request");
                self.core.request_step_out();
                Ok(ResponseBody::StepOut)
            }
            command => Err(AdapterError::UnhandledCommand(command_name(command))),
        }
    }

    fn set_breakpoints(&self, args: &SetBreakpointsArguments) -> Vec<Breakpoint> {
        #[allow(deprecated)]
        let lines: Vec<i64> = match (&args.breakpoints, &args.lines) {
            (Some(breakpoints), _) => breakpoints.iter().map(|bp| bp.line).collect(),
            (None, Some(lines)) => lines.clone(),
            (None, None) => Vec::new(),
        };

        let verified = match &args.source.path {
            Some(path) => self
                .core
                .set_breakpoints(normalize_source_path(path), &lines),
            None => vec![false; lines.len()],
        };

        lines
            .iter()
            .zip(verified)
            .map(|(&line, verified)| Breakpoint {
                verified,
                line: Some(line),
                column: None,
                end_line: None,
                end_column: None,
                source: Some(args.source.clone()),
                message: (!verified).then(|| "Line is not part of a loaded source".to_string()),
                id: None,
                instruction_reference: None,
                offset: None,
            })
            .collect()
    }

    fn source_content(&mut self, args: &SourceArguments) -> Result<String, AdapterError> {
        let reference = i64::from(args.source_reference);
        let path = match args.source.as_ref().and_then(|source| source.path.as_ref()) {
            Some(path) => normalize_source_path(path),
            None if reference == SOURCE_REFERENCE => {
                self.core.current_snapshot().current_source_file.clone()
            }
            None => return Err(AdapterError::UnknownSourceReference(reference)),
        };

        if let Some(content) = self.sources.get(&path) {
            return Ok(content.clone());
        }

        let content =
            std::fs::read_to_string(&path).map_err(|e| AdapterError::SourceUnavailable {
                path: path.clone(),
                message: e.to_string(),
            })?;
        self.sources.insert(path, content.clone());
        Ok(content)
    }
}

/// Frames of the snapshot, innermost first.
pub(crate) fn stack_frames(snapshot: &StopSnapshot) -> Vec<types::StackFrame> {
    snapshot
        .backtrace
        .iter()
        .map(|frame| {
            let name = if frame.line == 0 {
                format!("File entered: {}", frame.file_path.display())
            } else {
                frame.name.clone()
            };
            types::StackFrame {
                id: FRAME_ID,
                name,
                source: Some(source(&frame.file_path)),
                line: frame.line,
                column: 1,
                ..Default::default()
            }
        })
        .collect()
}

fn source(path: &Path) -> types::Source {
    types::Source {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().to_string()),
        path: Some(path.display().to_string()),
        source_reference: Some(SOURCE_REFERENCE as _),
        ..Default::default()
    }
}

fn scope(name: &str, variables_reference: i64) -> types::Scope {
    types::Scope {
        name: name.to_string(),
        variables_reference,
        expensive: false,
        named_variables: None,
        indexed_variables: None,
        source: None,
        line: None,
        column: None,
        end_line: None,
        end_column: None,
        presentation_hint: None,
    }
}

fn variables(entries: &Variables) -> Vec<types::Variable> {
    entries
        .iter()
        .map(|(name, value)| types::Variable {
            name: name.clone(),
            value: value.clone(),
            type_field: Some("string".to_string()),
            variables_reference: 0,
            named_variables: None,
            indexed_variables: None,
            presentation_hint: None,
            evaluate_name: None,
            memory_reference: None,
        })
        .collect()
}

/// Variant name of a command, e.g. `Goto`.
fn command_name(command: &Command) -> String {
    let debug = format!("{command:?}");
    debug
        .split(|c: char| !c.is_alphanumeric())
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use cmdbg_lang::{Backtrace, Frame};
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::testing::{request, server};

    fn adapter() -> DapAdapter {
        DapAdapter::new(
            Arc::new(DebuggerCore::new()),
            Arc::new(LaunchState::default()),
        )
    }

    /// Sends one request and returns the response.
    fn roundtrip(adapter: &mut DapAdapter, message: serde_json::Value) -> serde_json::Value {
        let (mut server, out) = server();
        let control = adapter.handle_request(request(message), &mut server).unwrap();
        assert_eq!(control, SessionControl::Continue);
        out.messages().remove(0)
    }

    #[test]
    fn test_initialize_responds_before_initialized_event() {
        let mut adapter = adapter();
        let (mut server, out) = server();
        let req = request(json!({
            "seq": 1,
            "command": "initialize",
            "arguments": {"adapterID": "cmdbg"}
        }));

        adapter.handle_request(req, &mut server).unwrap();

        let messages = out.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["type"], "response");
        assert_eq!(messages[0]["command"], "initialize");
        assert_eq!(messages[0]["body"]["supportsConfigurationDoneRequest"], true);
        assert_eq!(messages[1]["type"], "event");
        assert_eq!(messages[1]["event"], "initialized");
    }

    #[test]
    fn test_threads() {
        let rsp = roundtrip(&mut adapter(), json!({"seq": 1, "command": "threads"}));
        assert_eq!(rsp["success"], true);
        assert_eq!(rsp["body"]["threads"], json!([{"id": 100, "name": "main"}]));
    }

    #[rstest]
    #[case(json!({"seq": 2, "command": "stackTrace", "arguments": {"threadId": 1}}))]
    #[case(json!({"seq": 2, "command": "scopes", "arguments": {"frameId": 0}}))]
    #[case(json!({"seq": 2, "command": "variables", "arguments": {"variablesReference": 3}}))]
    #[case(json!({"seq": 2, "command": "source", "arguments": {"sourceReference": 1}}))]
    #[case(json!({"seq": 2, "command": "goto", "arguments": {"threadId": 100, "targetId": 1}}))]
    fn test_invalid_requests_get_error_responses(#[case] message: serde_json::Value) {
        let rsp = roundtrip(&mut adapter(), message);
        assert_eq!(rsp["type"], "response");
        assert_eq!(rsp["success"], false);
    }

    #[test]
    fn test_scopes_for_known_frame() {
        let rsp = roundtrip(
            &mut adapter(),
            json!({"seq": 1, "command": "scopes", "arguments": {"frameId": 200}}),
        );
        let scopes = rsp["body"]["scopes"].as_array().unwrap();
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[0]["name"], "Locals");
        assert_eq!(scopes[0]["variablesReference"], 1);
        assert_eq!(scopes[1]["name"], "Cache Variable");
        assert_eq!(scopes[1]["variablesReference"], 2);
    }

    #[test]
    fn test_stack_trace_before_any_stop_is_empty() {
        let rsp = roundtrip(
            &mut adapter(),
            json!({"seq": 1, "command": "stackTrace", "arguments": {"threadId": 100}}),
        );
        assert_eq!(rsp["success"], true);
        assert_eq!(rsp["body"]["stackFrames"], json!([]));
    }

    #[test]
    fn test_stack_frames_innermost_first() {
        let snapshot = StopSnapshot {
            backtrace: Backtrace::from_frames([
                Frame::new("/src/CMakeLists.txt", "include", 3),
                Frame::new("/src/util.cmake", "util.cmake", 0),
            ]),
            current_line: 0,
            current_source_file: PathBuf::from("/src/util.cmake"),
            ..Default::default()
        };

        let frames = stack_frames(&snapshot);
        assert_eq!(frames.len(), snapshot.depth());
        assert_eq!(frames[0].name, "File entered: /src/util.cmake");
        assert_eq!(frames[0].line, 0);
        assert_eq!(frames[1].name, "include");
        assert_eq!(frames[1].line, 3);
        for frame in &frames {
            assert_eq!(frame.id, FRAME_ID);
            let source = frame.source.as_ref().unwrap();
            assert_eq!(source.source_reference.map(i64::from), Some(SOURCE_REFERENCE));
        }
        assert_eq!(
            frames[1].source.as_ref().unwrap().name.as_deref(),
            Some("CMakeLists.txt")
        );
    }

    #[test]
    fn test_variables_are_strings_in_host_order() {
        let entries = vec![
            ("B".to_string(), "2".to_string()),
            ("A".to_string(), "1".to_string()),
        ];
        let vars = variables(&entries);
        assert_eq!(vars[0].name, "B");
        assert_eq!(vars[1].value, "1");
        assert!(vars.iter().all(|v| v.type_field.as_deref() == Some("string")));
        assert!(vars.iter().all(|v| v.variables_reference == 0));
    }

    #[test]
    fn test_set_breakpoints_reports_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.cmake");
        std::fs::write(&path, "set(A 1)\nset(B 2)\n").unwrap();

        let core = Arc::new(DebuggerCore::new());
        core.register_source(normalize_source_path(&path), 2);
        let mut adapter = DapAdapter::new(Arc::clone(&core), Arc::new(LaunchState::default()));

        let rsp = roundtrip(
            &mut adapter,
            json!({
                "seq": 1,
                "command": "setBreakpoints",
                "arguments": {
                    "source": {"path": path.display().to_string()},
                    "breakpoints": [{"line": 2}, {"line": 9}]
                }
            }),
        );

        let breakpoints = rsp["body"]["breakpoints"].as_array().unwrap();
        assert_eq!(breakpoints[0]["verified"], true);
        assert_eq!(breakpoints[0]["line"], 2);
        assert_eq!(breakpoints[1]["verified"], false);
        assert_eq!(breakpoints[1]["line"], 9);
        assert_eq!(
            core.breakpoint_lines(&normalize_source_path(&path)),
            vec![2, 9]
        );
    }

    #[test]
    fn test_source_is_read_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.cmake");
        std::fs::write(&path, "set(A 1)\n").unwrap();
        let mut adapter = adapter();
        let message = json!({
            "seq": 1,
            "command": "source",
            "arguments": {
                "source": {"path": path.display().to_string()},
                "sourceReference": 400
            }
        });

        let first = roundtrip(&mut adapter, message.clone());
        std::fs::write(&path, "set(A 2)\n").unwrap();
        let second = roundtrip(&mut adapter, message);

        assert_eq!(first["body"]["content"], "set(A 1)\n");
        assert_eq!(second["body"]["content"], "set(A 1)\n");
    }

    #[test]
    fn test_source_unavailable() {
        let rsp = roundtrip(
            &mut adapter(),
            json!({
                "seq": 1,
                "command": "source",
                "arguments": {"source": {"path": "/does/not/exist.cmake"}, "sourceReference": 400}
            }),
        );
        assert_eq!(rsp["success"], false);
    }

    #[test]
    fn test_launch_and_configuration_done() {
        let launch = Arc::new(LaunchState::default());
        let mut adapter = DapAdapter::new(Arc::new(DebuggerCore::new()), Arc::clone(&launch));

        let rsp = roundtrip(
            &mut adapter,
            json!({"seq": 1, "command": "launch", "arguments": {"stopOnEntry": false}}),
        );
        assert_eq!(rsp["success"], true);
        assert!(!launch.stop_on_entry());
        assert!(!launch.is_configured());

        let rsp = roundtrip(&mut adapter, json!({"seq": 2, "command": "configurationDone"}));
        assert_eq!(rsp["success"], true);
        assert!(launch.is_configured());
    }

    #[test]
    fn test_control_requests_while_running_are_answered() {
        let core = Arc::new(DebuggerCore::new());
        let mut adapter = DapAdapter::new(Arc::clone(&core), Arc::new(LaunchState::default()));

        for command in ["continue", "next", "stepIn", "stepOut"] {
            let rsp = roundtrip(
                &mut adapter,
                json!({"seq": 1, "command": command, "arguments": {"threadId": 100}}),
            );
            assert_eq!(rsp["success"], true, "{command}");
        }
        assert_eq!(core.pause_action(), cmdbg_lang::PauseAction::None);

        roundtrip(
            &mut adapter,
            json!({"seq": 1, "command": "pause", "arguments": {"threadId": 100}}),
        );
        assert_eq!(core.pause_action(), cmdbg_lang::PauseAction::Pause);
    }

    #[rstest]
    #[case(json!({}), false)]
    #[case(json!({"terminateDebuggee": true}), true)]
    fn test_disconnect_detaches_core(
        #[case] arguments: serde_json::Value,
        #[case] terminate_debuggee: bool,
    ) {
        let core = Arc::new(DebuggerCore::new());
        let mut adapter = DapAdapter::new(Arc::clone(&core), Arc::new(LaunchState::default()));
        let (mut server, out) = server();

        let control = adapter
            .handle_request(
                request(json!({"seq": 1, "command": "disconnect", "arguments": arguments})),
                &mut server,
            )
            .unwrap();

        assert_eq!(control, SessionControl::Disconnect { terminate_debuggee });
        assert!(!core.is_active());
        assert_eq!(out.messages()[0]["command"], "disconnect");
    }

    #[test]
    fn test_command_name() {
        assert_eq!(command_name(&Command::Threads), "Threads");
        assert_eq!(command_name(&Command::ConfigurationDone), "ConfigurationDone");
    }
}
