use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use super::bridge::{HostBridge, StopSnapshot};
use super::sync::Gate;

/// Stepping mode in force, as reported to callers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Hash)]
pub enum PauseAction {
    #[default]
    None,
    Pause,
    StepOver,
    StepInto,
    StepOut,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum StepKind {
    /// Stop at the next statement at the same depth or shallower.
    Over,
    /// Stop at the very next statement.
    Into,
    /// Stop at the next statement strictly shallower.
    Out,
}

/// Execution state consulted at every candidate stop point.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ExecutionState {
    /// Free running; only breakpoints stop.
    #[default]
    Running,
    /// Stop at the next candidate.
    PausePending,
    Stepping { kind: StepKind, target_depth: usize },
}

impl ExecutionState {
    pub fn pause_action(&self) -> PauseAction {
        match self {
            ExecutionState::Running => PauseAction::None,
            ExecutionState::PausePending => PauseAction::Pause,
            ExecutionState::Stepping { kind: StepKind::Over, .. } => PauseAction::StepOver,
            ExecutionState::Stepping { kind: StepKind::Into, .. } => PauseAction::StepInto,
            ExecutionState::Stepping { kind: StepKind::Out, .. } => PauseAction::StepOut,
        }
    }

    /// Whether a candidate at `depth` stops, breakpoints aside.
    pub fn should_stop(&self, depth: usize) -> bool {
        match *self {
            ExecutionState::Running => false,
            ExecutionState::PausePending => true,
            ExecutionState::Stepping {
                kind: StepKind::Into,
                ..
            } => true,
            ExecutionState::Stepping {
                kind: StepKind::Over,
                target_depth,
            } => depth <= target_depth,
            ExecutionState::Stepping {
                kind: StepKind::Out,
                target_depth,
            } => depth < target_depth,
        }
    }
}

/// Why the host thread stopped.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DebuggerEvent {
    BreakpointHit { source: PathBuf, line: i64 },
    Stepped { source: PathBuf, line: i64 },
    Paused { source: PathBuf, line: i64 },
}

/// Receives stop notifications, one method per [`DebuggerEvent`] variant.
///
/// Called on the host thread while the debugger lock is held: handlers must
/// not call back into the [`DebuggerCore`].
pub trait DebuggerHandler: Send + Sync {
    fn on_breakpoint_hit(&self, _source: &Path, _line: i64) {}

    fn on_step(&self, _source: &Path, _line: i64) {}

    fn on_pause(&self, _source: &Path, _line: i64) {}
}

#[derive(Debug, Default)]
pub struct DefaultDebuggerHandler;

impl DebuggerHandler for DefaultDebuggerHandler {}

fn dispatch(handler: &dyn DebuggerHandler, event: &DebuggerEvent) {
    match event {
        DebuggerEvent::BreakpointHit { source, line } => handler.on_breakpoint_hit(source, *line),
        DebuggerEvent::Stepped { source, line } => handler.on_step(source, *line),
        DebuggerEvent::Paused { source, line } => handler.on_pause(source, *line),
    }
}

#[derive(Debug, Default)]
struct Breakpoints {
    by_source: HashMap<PathBuf, BTreeSet<i64>>,
    /// Lines that match in any source.
    unscoped: BTreeSet<i64>,
}

impl Breakpoints {
    fn contains(&self, source: &Path, line: i64) -> bool {
        self.unscoped.contains(&line)
            || self
                .by_source
                .get(source)
                .is_some_and(|lines| lines.contains(&line))
    }
}

#[derive(Debug)]
struct CoreState {
    active: bool,
    breakpoints: Breakpoints,
    source_lines: HashMap<PathBuf, usize>,
    execution: ExecutionState,
    /// Depth of the most recent stop.
    stop_depth: usize,
    snapshot: Arc<StopSnapshot>,
}

impl Default for CoreState {
    fn default() -> Self {
        Self {
            active: true,
            breakpoints: Breakpoints::default(),
            source_lines: HashMap::new(),
            execution: ExecutionState::Running,
            stop_depth: 0,
            snapshot: Arc::new(StopSnapshot::default()),
        }
    }
}

/// Pauses and releases the host thread on behalf of a debugging client.
///
/// The host calls [`DebuggerCore::notify_stop_candidate`] (or
/// [`DebuggerCore::pause_point`]) before every statement; request handlers on
/// other threads drive the `request_*` methods. All state sits behind a single
/// lock shared with the gate the host blocks on.
pub struct DebuggerCore {
    state: Gate<CoreState>,
    handler: Box<dyn DebuggerHandler>,
}

impl fmt::Debug for DebuggerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebuggerCore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for DebuggerCore {
    fn default() -> Self {
        Self::new()
    }
}

impl DebuggerCore {
    pub fn new() -> Self {
        Self::with_handler(Box::new(DefaultDebuggerHandler))
    }

    pub fn with_handler(handler: Box<dyn DebuggerHandler>) -> Self {
        Self {
            state: Gate::new(CoreState::default()),
            handler,
        }
    }

    /// Stops at the next candidate stop point. Ignored while already stopped.
    pub fn request_pause(&self) {
        let mut state = self.state.lock();
        if state.is_armed() {
            debug!("Pause requested while already stopped");
            return;
        }
        state.execution = ExecutionState::PausePending;
    }

    /// Resumes free running. Ignored unless the host is stopped.
    pub fn request_continue(&self) {
        let mut state = self.state.lock();
        if !state.is_armed() {
            debug!("Continue requested while running");
            return;
        }
        state.execution = ExecutionState::Running;
        self.state.release(&mut state);
    }

    pub fn request_step_over(&self) {
        self.request_step(StepKind::Over);
    }

    pub fn request_step_into(&self) {
        self.request_step(StepKind::Into);
    }

    pub fn request_step_out(&self) {
        self.request_step(StepKind::Out);
    }

    fn request_step(&self, kind: StepKind) {
        let mut state = self.state.lock();
        if !state.is_armed() {
            debug!(?kind, "Step requested while running");
            return;
        }
        let target_depth = state.stop_depth;
        state.execution = ExecutionState::Stepping { kind, target_depth };
        self.state.release(&mut state);
    }

    /// Announces a source the host has loaded, with its number of lines.
    pub fn register_source(&self, source: impl Into<PathBuf>, line_count: usize) {
        let mut state = self.state.lock();
        state.source_lines.insert(source.into(), line_count);
    }

    /// Replaces the breakpoints of `source`.
    ///
    /// Returns, per input line, whether it lies within the known source.
    /// Lines of sources the host has not registered yet are kept but reported
    /// as unverified.
    pub fn set_breakpoints(&self, source: impl Into<PathBuf>, lines: &[i64]) -> Vec<bool> {
        let source = source.into();
        let mut state = self.state.lock();

        let line_count = state.source_lines.get(&source).copied();
        let verified = lines
            .iter()
            .map(|&line| line_count.is_some_and(|count| line >= 1 && line <= count as i64))
            .collect();

        debug!(source = %source.display(), ?lines, "Replacing breakpoints");
        if lines.is_empty() {
            state.breakpoints.by_source.remove(&source);
        } else {
            state
                .breakpoints
                .by_source
                .insert(source, lines.iter().copied().collect());
        }

        verified
    }

    /// Removes every breakpoint, scoped or not.
    pub fn clear_breakpoints(&self) {
        let mut state = self.state.lock();
        state.breakpoints = Breakpoints::default();
    }

    /// Adds a breakpoint that matches `line` in any source.
    pub fn add_breakpoint(&self, line: i64) {
        let mut state = self.state.lock();
        state.breakpoints.unscoped.insert(line);
    }

    /// Breakpoint lines currently set for `source`, unscoped ones included.
    pub fn breakpoint_lines(&self, source: &Path) -> Vec<i64> {
        let state = self.state.lock();
        let mut lines: BTreeSet<i64> = state.breakpoints.unscoped.clone();
        if let Some(scoped) = state.breakpoints.by_source.get(source) {
            lines.extend(scoped);
        }
        lines.into_iter().collect()
    }

    /// Collects a candidate from the host and offers it to
    /// [`DebuggerCore::notify_stop_candidate`].
    pub fn pause_point(&self, host: &(impl HostBridge + ?Sized)) {
        if !self.is_active() {
            return;
        }
        self.notify_stop_candidate(StopSnapshot::capture(host));
    }

    /// The single synchronization point for the host thread.
    ///
    /// Decides whether the candidate stops; if it does, publishes it as the
    /// current snapshot, notifies the handler and blocks until a control
    /// request releases the gate.
    pub fn notify_stop_candidate(&self, candidate: StopSnapshot) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }

        let depth = candidate.depth();
        let source = candidate.current_source_file.clone();
        let line = candidate.current_line;

        let event = if state.breakpoints.contains(&source, line) {
            DebuggerEvent::BreakpointHit { source, line }
        } else if state.execution.should_stop(depth) {
            match state.execution {
                ExecutionState::PausePending => DebuggerEvent::Paused { source, line },
                _ => DebuggerEvent::Stepped { source, line },
            }
        } else {
            trace!(depth, line, "Candidate stop point passed");
            return;
        };

        debug!(?event, depth, "Stopping host thread");
        state.snapshot = Arc::new(candidate);
        state.stop_depth = depth;
        state.arm();
        dispatch(self.handler.as_ref(), &event);

        let state = self.state.wait(state);
        debug!(execution = ?state.execution, "Host thread released");
    }

    /// The most recent stop. Stale while the host is running.
    pub fn current_snapshot(&self) -> Arc<StopSnapshot> {
        Arc::clone(&self.state.lock().snapshot)
    }

    /// Whether the host thread is currently blocked at a stop.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().is_armed()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn pause_action(&self) -> PauseAction {
        self.state.lock().execution.pause_action()
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.state.lock().execution
    }

    /// Depth recorded at the current stop, or the depth an in-flight step
    /// compares against while running.
    pub fn target_depth(&self) -> usize {
        let state = self.state.lock();
        match state.execution {
            ExecutionState::Stepping { target_depth, .. } if !state.is_armed() => target_depth,
            _ => state.stop_depth,
        }
    }

    /// Ends the debug session: drops every breakpoint, stops consulting the
    /// host and lets a blocked host thread run to completion.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.active = false;
        state.breakpoints = Breakpoints::default();
        state.execution = ExecutionState::Running;
        if self.state.release(&mut state) {
            debug!("Released host thread on detach");
        }
    }
}
