use std::borrow::Cow;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Protocol error: {0}")]
    ProtocolError(Cow<'static, str>),
    #[error("Unhandled command: {0}")]
    UnhandledCommand(String),
    #[error("Unknown thread id: {0}")]
    UnknownThreadId(i64),
    #[error("Unknown frame id: {0}")]
    UnknownFrameId(i64),
    #[error("Unknown variables reference: {0}")]
    UnknownVariablesReference(i64),
    #[error("Unknown source reference: {0}")]
    UnknownSourceReference(i64),
    #[error("Source unavailable: {}: {message}", .path.display())]
    SourceUnavailable { path: PathBuf, message: String },
    #[error("Failed to deserialize launch arguments: {0}")]
    LaunchArgumentsError(#[from] serde_json::Error),
    #[error("Transport error: {0}")]
    Transport(String),
}
