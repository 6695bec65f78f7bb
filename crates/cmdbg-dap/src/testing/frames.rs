use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Writer whose bytes stay readable after the server has taken ownership.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn messages(&self) -> Vec<Value> {
        decode_frames(&self.0.lock().unwrap())
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn encode_frame(message: &Value) -> Vec<u8> {
    let body = message.to_string();
    format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
}

/// Splits `Content-Length` framed output into JSON messages.
pub fn decode_frames(bytes: &[u8]) -> Vec<Value> {
    const HEADER: &str = "Content-Length: ";

    let text = String::from_utf8_lossy(bytes);
    let mut rest: &str = &text;
    let mut messages = Vec::new();

    while let Some(start) = rest.find(HEADER) {
        let after = &rest[start + HEADER.len()..];
        let Some(header_end) = after.find("\r\n\r\n") else {
            break;
        };
        let len: usize = after[..header_end].trim().parse().unwrap();
        let body = header_end + 4;
        if after.len() < body + len {
            break;
        }
        messages.push(serde_json::from_str(&after[body..body + len]).unwrap());
        rest = &after[body + len..];
    }

    messages
}
