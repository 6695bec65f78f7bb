use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

/// Optional file receiving a copy of every byte exchanged with the client.
#[derive(Debug, Clone, Default)]
pub struct TrafficLog {
    file: Arc<Mutex<Option<File>>>,
}

impl TrafficLog {
    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        debug!(path = %path.display(), "Recording DAP traffic");
        Ok(Self {
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    pub fn is_open(&self) -> bool {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn record(&self, bytes: &[u8]) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = file.as_mut()
            && let Err(e) = log.write_all(bytes).and_then(|_| log.flush())
        {
            warn!(error = %e, "Failed to record DAP traffic, closing traffic log");
            *file = None;
        }
    }

    /// Stops recording. Later traffic is not mirrored.
    pub fn close(&self, reason: &str) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if file.take().is_some() {
            debug!(reason, "Closed traffic log");
        }
    }
}

/// Passes reads and writes through to `inner`, mirroring the bytes into a
/// [`TrafficLog`].
#[derive(Debug)]
pub struct Spy<T> {
    inner: T,
    log: TrafficLog,
}

impl<T> Spy<T> {
    pub fn new(inner: T, log: TrafficLog) -> Self {
        Self { inner, log }
    }
}

impl<T: Read> Read for Spy<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.log.record(&buf[..n]);
        Ok(n)
    }
}

impl<T: Write> Write for Spy<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.log.record(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Body of the most recent complete frame read by a [`FrameReader`].
#[derive(Debug, Clone, Default)]
pub struct LastFrame(Arc<Mutex<Option<Vec<u8>>>>);

impl LastFrame {
    fn set(&self, body: Vec<u8>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(body);
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Hands out at most one `Content-Length` frame per read, so a frame the
/// protocol layer rejects is still available from [`LastFrame`].
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    /// Read from `inner` but not handed out yet.
    pending: Vec<u8>,
    /// Bytes of the current frame handed out so far.
    frame: Vec<u8>,
    /// Header and body length of the current frame, once its header is in.
    frame_len: Option<(usize, usize)>,
    last: LastFrame,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R, last: LastFrame) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            frame: Vec::new(),
            frame_len: None,
            last,
        }
    }
}

impl<R: Read> FrameReader<R> {
    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 8192];
        let n = self.inner.read(&mut chunk)?;
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn hand_out(&mut self, buf: &mut [u8], limit: usize) -> usize {
        let n = buf.len().min(limit).min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.frame.extend(self.pending.drain(..n));
        n
    }
}

impl<R: Read> Read for FrameReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.frame_len.is_none() {
            match frame_header(&self.pending) {
                Some((header_len, body_len)) => self.frame_len = Some((header_len, body_len)),
                None => {
                    if self.fill()? == 0 {
                        // Trailing bytes without a complete header.
                        let n = self.hand_out(buf, usize::MAX);
                        self.frame.clear();
                        return Ok(n);
                    }
                }
            }
        }

        let Some((header_len, body_len)) = self.frame_len else {
            return Ok(0);
        };
        if self.pending.is_empty() && self.fill()? == 0 {
            return Ok(0);
        }

        let n = self.hand_out(buf, header_len + body_len - self.frame.len());
        if self.frame.len() == header_len + body_len {
            self.last.set(self.frame.split_off(header_len));
            self.frame.clear();
            self.frame_len = None;
        }
        Ok(n)
    }
}

/// Length of the header block at the start of `bytes` and the body length it
/// announces. A header without `Content-Length` announces an empty body.
fn frame_header(bytes: &[u8]) -> Option<(usize, usize)> {
    let header_len = bytes.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let header = String::from_utf8_lossy(&bytes[..header_len]);
    let body_len = header
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);
    Some((header_len, body_len))
}
