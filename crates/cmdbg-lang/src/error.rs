use std::path::PathBuf;

use miette::Diagnostic;

/// Errors raised while loading or evaluating a list file.
#[derive(Debug, thiserror::Error, Diagnostic, PartialEq)]
pub enum ScriptError {
    #[error("{}:{line}: unexpected character '{ch}'", .path.display())]
    UnexpectedCharacter { path: PathBuf, line: i64, ch: char },
    #[error("{}:{line}: expected '(' after \"{name}\"", .path.display())]
    ExpectedOpenParen { path: PathBuf, line: i64, name: String },
    #[error("{}:{line}: unterminated argument list", .path.display())]
    UnterminatedCommand { path: PathBuf, line: i64 },
    #[error("{}:{line}: unterminated quoted argument", .path.display())]
    UnterminatedString { path: PathBuf, line: i64 },
    #[error("{}:{line}: unknown command \"{name}\"", .path.display())]
    #[diagnostic(help("supported commands: set, unset, message, include, function, endfunction"))]
    UnknownCommand { path: PathBuf, line: i64, name: String },
    #[error("{}:{line}: {command}() {message}", .path.display())]
    InvalidArguments {
        path: PathBuf,
        line: i64,
        command: String,
        message: String,
    },
    #[error("{}:{line}: function() without a matching endfunction()", .path.display())]
    UnterminatedFunction { path: PathBuf, line: i64 },
    #[error("{}:{line}: endfunction() without a matching function()", .path.display())]
    UnexpectedEndFunction { path: PathBuf, line: i64 },
    #[error("{}:{line}: maximum call depth of {limit} exceeded", .path.display())]
    RecursionLimit { path: PathBuf, line: i64, limit: usize },
    #[error("{}:{line}: {message}", .path.display())]
    Fatal { path: PathBuf, line: i64, message: String },
    #[error("Failed to read '{}': {message}", .path.display())]
    Io { path: PathBuf, message: String },
}
