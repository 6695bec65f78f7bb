use std::path::{Path, PathBuf};

/// Ordered `name -> value` pairs, in the order the host reports them.
pub type Variables = Vec<(String, String)>;

/// A single entry of a host call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub file_path: PathBuf,
    /// Command or function name executing in this frame.
    pub name: String,
    /// 1-based line, `0` when a file has just been entered.
    pub line: i64,
}

impl Frame {
    pub fn new(file_path: impl Into<PathBuf>, name: impl Into<String>, line: i64) -> Self {
        Self {
            file_path: file_path.into(),
            name: name.into(),
            line,
        }
    }
}

/// Call stack of the host.
///
/// Frames are pushed outermost first; [`Backtrace::iter`] and
/// [`Backtrace::top`] present them innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    frames: Vec<Frame>,
}

impl Backtrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a backtrace from frames ordered outermost first.
    pub fn from_frames(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    /// Pushes a new innermost frame.
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Removes the innermost frame, walking one level outward.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames innermost first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Frame> + ExactSizeIterator {
        self.frames.iter().rev()
    }
}

/// What the debugger needs from the script host at a candidate stop point.
pub trait HostBridge {
    fn backtrace(&self) -> Backtrace;

    fn current_line(&self) -> i64;

    fn current_source_file(&self) -> PathBuf;

    fn local_variables(&self) -> Variables;

    fn cache_entry_keys(&self) -> Vec<String>;

    fn cache_entry_value(&self, key: &str) -> Option<String>;
}

/// Host state captured at a stop point.
///
/// A fresh snapshot is built for every candidate; the debugger publishes it
/// whole and never edits it afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopSnapshot {
    pub backtrace: Backtrace,
    pub current_line: i64,
    pub current_source_file: PathBuf,
    pub local_variables: Variables,
    pub cache_entries: Variables,
}

impl StopSnapshot {
    pub fn capture(host: &(impl HostBridge + ?Sized)) -> Self {
        let cache_entries = host
            .cache_entry_keys()
            .into_iter()
            .filter_map(|key| {
                let value = host.cache_entry_value(&key)?;
                Some((key, value))
            })
            .collect();

        Self {
            backtrace: host.backtrace(),
            current_line: host.current_line(),
            current_source_file: host.current_source_file(),
            local_variables: host.local_variables(),
            cache_entries,
        }
    }

    pub fn depth(&self) -> usize {
        self.backtrace.depth()
    }
}

/// Canonical identifier for a source path, so that the host and the client
/// agree on breakpoint keys. Paths that cannot be resolved are kept as given.
pub fn normalize_source_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHost;

    impl HostBridge for FixedHost {
        fn backtrace(&self) -> Backtrace {
            Backtrace::from_frames([
                Frame::new("CMakeLists.txt", "include", 4),
                Frame::new("util.cmake", "set", 2),
            ])
        }

        fn current_line(&self) -> i64 {
            2
        }

        fn current_source_file(&self) -> PathBuf {
            PathBuf::from("util.cmake")
        }

        fn local_variables(&self) -> Variables {
            vec![("B".to_string(), "2".to_string()), ("A".to_string(), "1".to_string())]
        }

        fn cache_entry_keys(&self) -> Vec<String> {
            vec!["MISSING".to_string(), "BUILD_TYPE".to_string()]
        }

        fn cache_entry_value(&self, key: &str) -> Option<String> {
            (key == "BUILD_TYPE").then(|| "Debug".to_string())
        }
    }

    #[test]
    fn test_backtrace_is_innermost_first() {
        let mut backtrace = Backtrace::new();
        backtrace.push(Frame::new("a", "outer", 1));
        backtrace.push(Frame::new("b", "inner", 2));

        assert_eq!(backtrace.depth(), 2);
        assert_eq!(backtrace.top().map(|f| f.name.as_str()), Some("inner"));
        let names: Vec<_> = backtrace.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["inner", "outer"]);

        assert_eq!(backtrace.pop().map(|f| f.name), Some("inner".to_string()));
        assert_eq!(backtrace.top().map(|f| f.name.as_str()), Some("outer"));
    }

    #[test]
    fn test_capture_keeps_host_order_and_skips_missing_cache_values() {
        let snapshot = StopSnapshot::capture(&FixedHost);

        assert_eq!(snapshot.depth(), 2);
        assert_eq!(snapshot.current_line, 2);
        assert_eq!(snapshot.current_source_file, PathBuf::from("util.cmake"));
        assert_eq!(snapshot.local_variables[0].0, "B");
        assert_eq!(
            snapshot.cache_entries,
            vec![("BUILD_TYPE".to_string(), "Debug".to_string())]
        );
    }

    #[test]
    fn test_normalize_source_path_keeps_unresolvable_paths() {
        assert_eq!(
            normalize_source_path("does/not/exist.cmake"),
            PathBuf::from("does/not/exist.cmake")
        );
    }
}
