use std::io::{self, Write};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use dap::types::OutputEventCategory;
use tracing_subscriber::fmt::MakeWriter;

use crate::handler::DapEventSender;

/// Log sink for the tracing subscriber.
///
/// Stdout carries the protocol, so formatted records go over a channel and
/// reach the client as `output` events on the debug console.
#[derive(Clone)]
pub struct DebugConsoleWriter {
    sender: Sender<String>,
}

impl DebugConsoleWriter {
    pub fn new() -> (Self, Receiver<String>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { sender: tx }, rx)
    }
}

impl Write for DebugConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let message = String::from_utf8_lossy(buf).into_owned();
        // A closed channel only means nobody forwards logs any more.
        let _ = self.sender.send(message);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DebugConsoleWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Sends every log record to the client until the channel closes.
pub fn spawn_forwarder<W>(
    log_rx: Receiver<String>,
    events: DapEventSender<W>,
) -> io::Result<thread::JoinHandle<()>>
where
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name("cmdbg-log".to_string())
        .spawn(move || {
            for message in log_rx {
                events.output(OutputEventCategory::Console, &message);
            }
        })
}
