use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;

use crate::error::ScriptError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub value: String,
    pub quoted: bool,
}

/// A single `name(arg ...)` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Lowercased command name.
    pub name: String,
    pub args: Vec<Argument>,
    /// Line the command name starts on.
    pub line: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFile {
    pub path: PathBuf,
    pub commands: Vec<Command>,
    pub line_count: usize,
}

/// Parses list-file source text.
pub fn parse(path: impl Into<PathBuf>, source: &str) -> Result<ListFile, ScriptError> {
    let path = path.into();
    let commands = Parser::new(&path, source).commands()?;
    Ok(ListFile {
        line_count: source.lines().count(),
        path,
        commands,
    })
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
    path: &'a Path,
    line: i64,
}

impl<'a> Parser<'a> {
    fn new(path: &'a Path, source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            path,
            line: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_comment(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_trivia(&mut self) {
        while let Some(&c) = self.chars.peek() {
            match c {
                '#' => self.skip_comment(),
                c if c.is_whitespace() => {
                    self.bump();
                }
                _ => break,
            }
        }
    }

    fn commands(mut self) -> Result<Vec<Command>, ScriptError> {
        let mut commands = Vec::new();

        loop {
            self.skip_trivia();
            let Some(&c) = self.chars.peek() else {
                return Ok(commands);
            };

            if !(c.is_ascii_alphabetic() || c == '_') {
                return Err(ScriptError::UnexpectedCharacter {
                    path: self.path.to_path_buf(),
                    line: self.line,
                    ch: c,
                });
            }

            let line = self.line;
            let name = self.identifier();
            while matches!(self.chars.peek(), Some(' ' | '\t')) {
                self.bump();
            }

            if self.bump() != Some('(') {
                return Err(ScriptError::ExpectedOpenParen {
                    path: self.path.to_path_buf(),
                    line,
                    name,
                });
            }

            let args = self.arguments(line)?;
            commands.push(Command {
                name: name.to_ascii_lowercase(),
                args,
                line,
            });
        }
    }

    fn identifier(&mut self) -> String {
        let mut name = String::new();
        while let Some(&c) = self.chars.peek() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            name.push(c);
            self.bump();
        }
        name
    }

    fn arguments(&mut self, start_line: i64) -> Result<Vec<Argument>, ScriptError> {
        let mut args = Vec::new();

        loop {
            self.skip_trivia();
            match self.chars.peek().copied() {
                None => {
                    return Err(ScriptError::UnterminatedCommand {
                        path: self.path.to_path_buf(),
                        line: start_line,
                    });
                }
                Some(')') => {
                    self.bump();
                    return Ok(args);
                }
                Some('"') => {
                    self.bump();
                    args.push(self.quoted()?);
                }
                Some('(') => {
                    return Err(ScriptError::UnexpectedCharacter {
                        path: self.path.to_path_buf(),
                        line: self.line,
                        ch: '(',
                    });
                }
                Some(_) => args.push(self.unquoted()),
            }
        }
    }

    fn quoted(&mut self) -> Result<Argument, ScriptError> {
        let line = self.line;
        let mut value = String::new();

        loop {
            match self.bump() {
                None => {
                    return Err(ScriptError::UnterminatedString {
                        path: self.path.to_path_buf(),
                        line,
                    });
                }
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(c) => value.push(c),
                    None => {
                        return Err(ScriptError::UnterminatedString {
                            path: self.path.to_path_buf(),
                            line,
                        });
                    }
                },
                Some(c) => value.push(c),
            }
        }

        Ok(Argument { value, quoted: true })
    }

    fn unquoted(&mut self) -> Argument {
        let mut value = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || matches!(c, '(' | ')' | '#' | '"') {
                break;
            }
            value.push(c);
            self.bump();
        }
        Argument { value, quoted: false }
    }
}
