use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, warn};

use crate::debugger::{
    Backtrace, DebuggerCore, Frame, HostBridge, Variables, normalize_source_path,
};
use crate::error::ScriptError;
use crate::script::{self, Argument, Command, ListFile};

type Scope = BTreeMap<String, String>;

/// Receives every line produced by `message()`.
pub type OutputFn = Box<dyn FnMut(&str) + Send>;

const MESSAGE_MODES: &[&str] = &[
    "STATUS",
    "WARNING",
    "AUTHOR_WARNING",
    "SEND_ERROR",
    "FATAL_ERROR",
    "DEPRECATION",
    "NOTICE",
    "VERBOSE",
    "DEBUG",
    "TRACE",
];

/// Configuration options for the evaluator.
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum number of nested files and function calls.
    pub max_call_stack_depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_call_stack_depth: 100,
        }
    }
}

#[derive(Debug)]
struct Function {
    name: String,
    params: Vec<String>,
    body: Arc<[Command]>,
    file: PathBuf,
}

/// Executes list files one statement at a time.
///
/// When a [`DebuggerCore`] is attached, every statement is offered to it as a
/// candidate stop point before it runs. The evaluator itself is the
/// [`HostBridge`] the debugger snapshots.
pub struct Evaluator {
    scope: Scope,
    /// Enclosing function scopes, innermost last.
    parents: Vec<Scope>,
    cache: Scope,
    functions: HashMap<String, Arc<Function>>,
    backtrace: Backtrace,
    current_file: PathBuf,
    current_line: i64,
    messages: Vec<String>,
    output: Option<OutputFn>,
    debugger: Option<Arc<DebuggerCore>>,
    pub options: Options,
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("scope", &self.scope)
            .field("cache", &self.cache)
            .field("backtrace", &self.backtrace)
            .field("current_file", &self.current_file)
            .field("current_line", &self.current_line)
            .finish_non_exhaustive()
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            scope: Scope::new(),
            parents: Vec::new(),
            cache: Scope::new(),
            functions: HashMap::new(),
            backtrace: Backtrace::new(),
            current_file: PathBuf::new(),
            current_line: 0,
            messages: Vec::new(),
            output: None,
            debugger: None,
            options: Options::default(),
        }
    }

    pub fn with_debugger(mut self, debugger: Arc<DebuggerCore>) -> Self {
        self.set_debugger(debugger);
        self
    }

    pub fn with_output(mut self, output: impl FnMut(&str) + Send + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    pub fn set_debugger(&mut self, debugger: Arc<DebuggerCore>) {
        self.debugger = Some(debugger);
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.scope.get(name).map(String::as_str)
    }

    pub fn cache_entry(&self, name: &str) -> Option<&str> {
        self.cache.get(name).map(String::as_str)
    }

    /// Lines printed by `message()`, in order.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn run_file(&mut self, path: impl AsRef<Path>) -> Result<(), ScriptError> {
        let path = normalize_source_path(path);
        let source = read_source(&path)?;
        self.run_source(path, &source)
    }

    pub fn run_source(&mut self, path: impl Into<PathBuf>, source: &str) -> Result<(), ScriptError> {
        let file = script::parse(path, source)?;
        self.run_list_file(&file)
    }

    fn run_list_file(&mut self, file: &ListFile) -> Result<(), ScriptError> {
        self.check_depth()?;
        debug!(path = %file.path.display(), commands = file.commands.len(), "Entering list file");

        if let Some(debugger) = &self.debugger {
            debugger.register_source(file.path.clone(), file.line_count);
        }

        let saved_file = std::mem::replace(&mut self.current_file, file.path.clone());
        let saved_line = std::mem::replace(&mut self.current_line, 0);
        self.backtrace.push(Frame::new(
            &file.path,
            file.path.display().to_string(),
            0,
        ));

        let result = self.execute_block(&file.commands);

        self.backtrace.pop();
        self.current_file = saved_file;
        self.current_line = saved_line;
        result
    }

    fn execute_block(&mut self, commands: &[Command]) -> Result<(), ScriptError> {
        let mut index = 0;

        while index < commands.len() {
            let command = &commands[index];
            self.enter_statement(command);

            match command.name.as_str() {
                "function" => {
                    index = self.define_function(commands, index)?;
                }
                "endfunction" => {
                    return Err(ScriptError::UnexpectedEndFunction {
                        path: self.current_file.clone(),
                        line: command.line,
                    });
                }
                _ => self.execute_command(command)?,
            }

            index += 1;
        }

        Ok(())
    }

    fn enter_statement(&mut self, command: &Command) {
        self.current_line = command.line;
        if let Some(frame) = self.backtrace.top_mut() {
            frame.line = command.line;
            frame.name.clone_from(&command.name);
        }

        if let Some(debugger) = self.debugger.clone() {
            debugger.pause_point(&*self);
        }
    }

    /// Records the function starting at `start` and returns the index of its
    /// matching `endfunction()`.
    fn define_function(&mut self, commands: &[Command], start: usize) -> Result<usize, ScriptError> {
        let header = &commands[start];
        let mut nesting = 0usize;
        let mut end = None;

        for (index, command) in commands.iter().enumerate().skip(start + 1) {
            match command.name.as_str() {
                "function" => nesting += 1,
                "endfunction" if nesting == 0 => {
                    end = Some(index);
                    break;
                }
                "endfunction" => nesting -= 1,
                _ => {}
            }
        }

        let Some(end) = end else {
            return Err(ScriptError::UnterminatedFunction {
                path: self.current_file.clone(),
                line: header.line,
            });
        };

        let Some((name, params)) = header.args.split_first() else {
            return Err(self.invalid_arguments(header, "called with incorrect number of arguments"));
        };

        let function = Function {
            name: name.value.to_ascii_lowercase(),
            params: params.iter().map(|param| param.value.clone()).collect_vec(),
            body: commands[start + 1..end].into(),
            file: self.current_file.clone(),
        };
        debug!(name = %function.name, params = ?function.params, "Defined function");
        self.functions
            .insert(function.name.clone(), Arc::new(function));

        Ok(end)
    }

    fn execute_command(&mut self, command: &Command) -> Result<(), ScriptError> {
        let args = self.expand_arguments(&command.args);

        match command.name.as_str() {
            "set" => self.command_set(command, &args),
            "unset" => self.command_unset(command, &args),
            "message" => self.command_message(command, &args),
            "include" => self.command_include(command, &args),
            name => match self.functions.get(name).cloned() {
                Some(function) => self.call_function(command, &function, args),
                None => Err(ScriptError::UnknownCommand {
                    path: self.current_file.clone(),
                    line: command.line,
                    name: command.name.clone(),
                }),
            },
        }
    }

    fn command_set(&mut self, command: &Command, args: &[String]) -> Result<(), ScriptError> {
        let Some((name, values)) = args.split_first() else {
            return Err(self.invalid_arguments(command, "called with incorrect number of arguments"));
        };

        if let Some(position) = values.iter().position(|value| value == "CACHE") {
            let value = values[..position].iter().join(";");
            let force = values[position + 1..].iter().any(|value| value == "FORCE");
            if force || !self.cache.contains_key(name) {
                self.cache.insert(name.clone(), value);
            }
            return Ok(());
        }

        if let Some((last, values)) = values.split_last()
            && last == "PARENT_SCOPE"
        {
            let Some(parent) = self.parents.last_mut() else {
                warn!(name = %name, line = command.line, "PARENT_SCOPE used at the top level");
                return Ok(());
            };
            if values.is_empty() {
                parent.remove(name);
            } else {
                parent.insert(name.clone(), values.iter().join(";"));
            }
            return Ok(());
        }

        if values.is_empty() {
            self.scope.remove(name);
        } else {
            self.scope.insert(name.clone(), values.iter().join(";"));
        }
        Ok(())
    }

    fn command_unset(&mut self, command: &Command, args: &[String]) -> Result<(), ScriptError> {
        match args {
            [name] => {
                self.scope.remove(name);
            }
            [name, option] if option == "CACHE" => {
                self.cache.remove(name);
            }
            [name, option] if option == "PARENT_SCOPE" => {
                if let Some(parent) = self.parents.last_mut() {
                    parent.remove(name);
                }
            }
            _ => {
                return Err(self.invalid_arguments(command, "called with incorrect number of arguments"));
            }
        }
        Ok(())
    }

    fn command_message(&mut self, command: &Command, args: &[String]) -> Result<(), ScriptError> {
        let (mode, text) = match args.split_first() {
            Some((first, rest)) if MESSAGE_MODES.contains(&first.as_str()) => (first.as_str(), rest),
            _ => ("NOTICE", args),
        };
        let text = text.concat();

        let line = match mode {
            "STATUS" => format!("-- {text}"),
            "WARNING" | "AUTHOR_WARNING" => format!("Warning: {text}"),
            "DEPRECATION" => format!("Deprecation: {text}"),
            "SEND_ERROR" => format!("Error: {text}"),
            "FATAL_ERROR" => {
                return Err(ScriptError::Fatal {
                    path: self.current_file.clone(),
                    line: command.line,
                    message: text,
                });
            }
            _ => text,
        };

        if let Some(output) = self.output.as_mut() {
            output(&line);
        }
        self.messages.push(line);
        Ok(())
    }

    fn command_include(&mut self, command: &Command, args: &[String]) -> Result<(), ScriptError> {
        let Some((file, options)) = args.split_first() else {
            return Err(self.invalid_arguments(command, "called with incorrect number of arguments"));
        };
        let optional = options.iter().any(|option| option == "OPTIONAL");
        let path = self.resolve_path(file);

        match read_source(&path) {
            Ok(source) => {
                let file = script::parse(path, &source)?;
                self.run_list_file(&file)
            }
            Err(err) if optional => {
                debug!(%err, "Skipping optional include");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn call_function(
        &mut self,
        command: &Command,
        function: &Function,
        args: Vec<String>,
    ) -> Result<(), ScriptError> {
        self.check_depth()?;
        if args.len() < function.params.len() {
            return Err(self.invalid_arguments(command, "called with incorrect number of arguments"));
        }

        let mut scope = self.scope.clone();
        for (param, value) in function.params.iter().zip(&args) {
            scope.insert(param.clone(), value.clone());
        }
        for (index, value) in args.iter().enumerate() {
            scope.insert(format!("ARGV{index}"), value.clone());
        }
        scope.insert("ARGC".to_string(), args.len().to_string());
        scope.insert("ARGV".to_string(), args.iter().join(";"));
        scope.insert(
            "ARGN".to_string(),
            args[function.params.len()..].iter().join(";"),
        );

        let parent = std::mem::replace(&mut self.scope, scope);
        self.parents.push(parent);
        let saved_file = std::mem::replace(&mut self.current_file, function.file.clone());
        let saved_line = self.current_line;
        self.backtrace
            .push(Frame::new(&function.file, function.name.clone(), 0));

        let result = self.execute_block(&function.body);

        self.backtrace.pop();
        if let Some(parent) = self.parents.pop() {
            self.scope = parent;
        }
        self.current_file = saved_file;
        self.current_line = saved_line;
        result
    }

    fn expand_arguments(&self, args: &[Argument]) -> Vec<String> {
        args.iter()
            .flat_map(|arg| {
                let value = self.expand(&arg.value);
                if arg.quoted {
                    vec![value]
                } else {
                    value
                        .split(';')
                        .filter(|item| !item.is_empty())
                        .map(str::to_string)
                        .collect_vec()
                }
            })
            .collect_vec()
    }

    /// Replaces `${NAME}` references, innermost first. Unset names expand to
    /// an empty string; an unterminated reference is kept literally.
    fn expand(&self, input: &str) -> String {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            match closing_brace(after) {
                Some(end) => {
                    let name = self.expand(&after[..end]);
                    output.push_str(self.lookup(&name).unwrap_or_default());
                    rest = &after[end + 1..];
                }
                None => {
                    output.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }

        output.push_str(rest);
        output
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.variable(name).or_else(|| self.cache_entry(name))
    }

    fn resolve_path(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            return normalize_source_path(path);
        }
        let base = self.current_file.parent().unwrap_or_else(|| Path::new(""));
        normalize_source_path(base.join(path))
    }

    fn check_depth(&self) -> Result<(), ScriptError> {
        if self.backtrace.depth() >= self.options.max_call_stack_depth {
            return Err(ScriptError::RecursionLimit {
                path: self.current_file.clone(),
                line: self.current_line,
                limit: self.options.max_call_stack_depth,
            });
        }
        Ok(())
    }

    fn invalid_arguments(&self, command: &Command, message: &str) -> ScriptError {
        ScriptError::InvalidArguments {
            path: self.current_file.clone(),
            line: command.line,
            command: command.name.clone(),
            message: message.to_string(),
        }
    }
}

impl HostBridge for Evaluator {
    fn backtrace(&self) -> Backtrace {
        self.backtrace.clone()
    }

    fn current_line(&self) -> i64 {
        self.current_line
    }

    fn current_source_file(&self) -> PathBuf {
        self.current_file.clone()
    }

    fn local_variables(&self) -> Variables {
        self.scope
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    fn cache_entry_keys(&self) -> Vec<String> {
        self.cache.keys().cloned().collect()
    }

    fn cache_entry_value(&self, key: &str) -> Option<String> {
        self.cache.get(key).cloned()
    }
}

fn read_source(path: &Path) -> Result<String, ScriptError> {
    std::fs::read_to_string(path).map_err(|err| ScriptError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Byte offset of the `}` closing a reference whose `${` has been consumed.
fn closing_brace(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'$' if bytes.get(index + 1) == Some(&b'{') => {
                depth += 1;
                index += 1;
            }
            b'}' if depth == 0 => return Some(index),
            b'}' => depth -= 1,
            _ => {}
        }
        index += 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Mutex, mpsc};
    use std::thread;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::debugger::DebuggerHandler;

    fn run(source: &str) -> Result<Evaluator, ScriptError> {
        let mut eval = Evaluator::new();
        eval.run_source("test.cmake", source)?;
        Ok(eval)
    }

    #[rstest]
    #[case("set(A 1)\nmessage(\"${A}\")", vec!["1"])]
    #[case("set(A x)\nset(B A)\nmessage(\"${${B}}\")", vec!["x"])]
    #[case("set(L a b c)\nmessage(\"${L}\")", vec!["a;b;c"])]
    #[case("message(STATUS \"hello\" \" world\")", vec!["-- hello world"])]
    #[case("message(WARNING careful)", vec!["Warning: careful"])]
    #[case("message(\"${UNSET}|\")", vec!["|"])]
    #[case("message(\"${OPEN\")", vec!["${OPEN"])]
    fn test_messages(#[case] source: &str, #[case] expected: Vec<&str>) {
        let eval = run(source).unwrap();
        assert_eq!(eval.messages(), expected.as_slice());
    }

    #[test]
    fn test_set_and_unset() {
        let eval = run("set(A 1)\nset(B 2)\nunset(A)\nset(B)").unwrap();
        assert_eq!(eval.variable("A"), None);
        assert_eq!(eval.variable("B"), None);

        let eval = run("set(EMPTY \"\")").unwrap();
        assert_eq!(eval.variable("EMPTY"), Some(""));
    }

    #[test]
    fn test_cache_entries_are_kept_unless_forced() {
        let eval = run(concat!(
            "set(MODE Debug CACHE STRING \"build mode\")\n",
            "set(MODE Release CACHE STRING \"build mode\")\n",
            "set(FLAG on CACHE BOOL \"\")\n",
            "set(FLAG off CACHE BOOL \"\" FORCE)\n",
            "message(\"${MODE}\")\n",
        ))
        .unwrap();

        assert_eq!(eval.cache_entry("MODE"), Some("Debug"));
        assert_eq!(eval.cache_entry("FLAG"), Some("off"));
        assert_eq!(eval.variable("MODE"), None);
        assert_eq!(eval.messages(), &["Debug".to_string()]);
        assert_eq!(eval.cache_entry_keys(), vec!["FLAG".to_string(), "MODE".to_string()]);
    }

    #[test]
    fn test_function_scope_and_parent_scope() {
        let eval = run(concat!(
            "set(OUTER keep)\n",
            "function(work first)\n",
            "  set(OUTER changed)\n",
            "  set(RESULT \"${first}:${ARGC}:${ARGN}\" PARENT_SCOPE)\n",
            "endfunction()\n",
            "work(a b c)\n",
        ))
        .unwrap();

        assert_eq!(eval.variable("OUTER"), Some("keep"));
        assert_eq!(eval.variable("RESULT"), Some("a:3:b;c"));
        assert_eq!(eval.variable("first"), None);
    }

    #[test]
    fn test_function_names_are_case_insensitive() {
        let eval = run("FUNCTION(Say what)\nmessage(\"${what}\")\nENDFUNCTION()\nsay(hi)").unwrap();
        assert_eq!(eval.messages(), &["hi".to_string()]);
    }

    #[rstest]
    #[case("frobnicate(1)", "unknown command \"frobnicate\"")]
    #[case("set()", "set() called with incorrect number of arguments")]
    #[case("function(f)\nset(A 1)", "function() without a matching endfunction()")]
    #[case("endfunction()", "endfunction() without a matching function()")]
    #[case("message(FATAL_ERROR \"stop here\")", "test.cmake:1: stop here")]
    #[case("function(f a)\nendfunction()\nf()", "f() called with incorrect number of arguments")]
    #[case("include(missing.cmake)", "Failed to read")]
    fn test_errors(#[case] source: &str, #[case] expected: &str) {
        let err = run(source).unwrap_err();
        assert!(
            err.to_string().contains(expected),
            "{err} does not contain {expected}"
        );
    }

    #[test]
    fn test_recursion_limit() {
        let mut eval = Evaluator::new();
        eval.options.max_call_stack_depth = 8;
        let err = eval
            .run_source("test.cmake", "function(f)\nf()\nendfunction()\nf()")
            .unwrap_err();
        assert!(matches!(err, ScriptError::RecursionLimit { limit: 8, .. }));
    }

    #[test]
    fn test_include_relative_to_current_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("util.cmake"), "set(FROM_UTIL yes)\n").unwrap();
        std::fs::write(
            dir.path().join("CMakeLists.txt"),
            "include(util.cmake)\ninclude(absent.cmake OPTIONAL)\nmessage(\"${FROM_UTIL}\")\n",
        )
        .unwrap();

        let mut eval = Evaluator::new();
        eval.run_file(dir.path().join("CMakeLists.txt")).unwrap();
        assert_eq!(eval.messages(), &["yes".to_string()]);
    }

    #[test]
    fn test_output_callback_receives_messages() {
        let (tx, rx) = mpsc::channel();
        let mut eval = Evaluator::new().with_output(move |line| {
            let _ = tx.send(line.to_string());
        });
        eval.run_source("test.cmake", "message(one)\nmessage(two)").unwrap();
        assert_eq!(rx.try_iter().collect_vec(), vec!["one", "two"]);
    }

    struct BreakpointChannel(Mutex<mpsc::Sender<(PathBuf, i64)>>);

    impl DebuggerHandler for BreakpointChannel {
        fn on_breakpoint_hit(&self, source: &Path, line: i64) {
            let _ = self.0.lock().unwrap().send((source.to_path_buf(), line));
        }
    }

    #[test]
    fn test_breakpoint_inside_function_snapshots_call_stack() {
        let (tx, rx) = mpsc::channel();
        let core = Arc::new(DebuggerCore::with_handler(Box::new(BreakpointChannel(
            Mutex::new(tx),
        ))));
        core.set_breakpoints("a.cmake", &[3]);

        let host = {
            let core = Arc::clone(&core);
            thread::spawn(move || {
                let mut eval = Evaluator::new().with_debugger(core);
                eval.run_source(
                    "a.cmake",
                    concat!(
                        "function(greet who)\n",
                        "  set(GREETING \"hi ${who}\")\n",
                        "  message(\"${GREETING}\")\n",
                        "endfunction()\n",
                        "set(NAME world)\n",
                        "greet(${NAME})\n",
                    ),
                )
                .map(|_| eval.messages().to_vec())
            })
        };

        let (source, line) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(source, PathBuf::from("a.cmake"));
        assert_eq!(line, 3);

        let snapshot = core.current_snapshot();
        assert_eq!(snapshot.depth(), 2);
        let frames = snapshot
            .backtrace
            .iter()
            .map(|frame| (frame.name.as_str(), frame.line))
            .collect_vec();
        assert_eq!(frames, vec![("message", 3), ("greet", 6)]);
        assert!(
            snapshot
                .local_variables
                .contains(&("GREETING".to_string(), "hi world".to_string()))
        );
        assert!(
            snapshot
                .local_variables
                .contains(&("who".to_string(), "world".to_string()))
        );

        core.request_continue();
        let messages = host.join().unwrap().unwrap();
        assert_eq!(messages, vec!["hi world".to_string()]);
    }

    #[test]
    fn test_register_source_verifies_breakpoints() {
        let core = Arc::new(DebuggerCore::new());
        let mut eval = Evaluator::new().with_debugger(Arc::clone(&core));
        eval.run_source("b.cmake", "set(A 1)\nset(B 2)\n").unwrap();

        assert_eq!(core.set_breakpoints("b.cmake", &[2, 3]), vec![true, false]);
    }
}
