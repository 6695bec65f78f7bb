//! Helpers shared by the unit tests. `frames` is also compiled into the
//! integration tests.
use std::io::{BufReader, BufWriter, Cursor};

use dap::prelude::*;
use serde_json::Value;

use crate::transport::{FrameReader, LastFrame};

mod frames;

pub use frames::{SharedBuf, encode_frame};

pub type TestServer = Server<FrameReader<Cursor<Vec<u8>>>, SharedBuf>;

pub fn server() -> (TestServer, SharedBuf) {
    let (server, out, _) = server_with_input(&[]);
    (server, out)
}

/// A server whose client has already sent `messages` and then hung up.
pub fn server_with_input(messages: &[Value]) -> (TestServer, SharedBuf, LastFrame) {
    let input: Vec<u8> = messages.iter().flat_map(encode_frame).collect();
    let last = LastFrame::default();
    let out = SharedBuf::default();
    let server = Server::new(
        BufReader::new(FrameReader::new(Cursor::new(input), last.clone())),
        BufWriter::new(out.clone()),
    );
    (server, out, last)
}

pub fn request(message: Value) -> Request {
    serde_json::from_value(message).unwrap()
}
