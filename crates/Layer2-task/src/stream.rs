//! Stream buffer - line reassembly over a child's output stream
//!
//! Each buffer owns a fixed-capacity byte accumulator and an append-only line
//! history. Between drains the accumulator holds at most one unterminated
//! fragment; every `\n`-terminated prefix has already moved into the history.
//!
//! A drain never blocks longer than its readiness timeout:
//! - hang-up appends [`HANGUP_SENTINEL`] and returns `Error::ChildUnresponsive`
//! - readable data is read up to the remaining capacity and split into lines
//! - timeout changes nothing

use ioc_foundation::{Error, OverflowPolicy, Result, StreamConfig, DEFAULT_STREAM_CAPACITY};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Line appended when the child closes its end of the stream
pub const HANGUP_SENTINEL: &str = "*** IOC not responding ***";

/// Which output stream a buffer drains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamKind::Stderr)
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one successful drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Drain {
    /// Nothing became readable before the timeout
    #[default]
    Idle,
    /// Bytes were read; `lines` completed lines were added to the history
    Read { bytes: usize, lines: usize },
    /// Accumulator full under `OverflowPolicy::Hold`; nothing was read
    Full,
}

impl Drain {
    pub fn lines(&self) -> usize {
        match self {
            Drain::Read { lines, .. } => *lines,
            _ => 0,
        }
    }

    pub fn bytes(&self) -> usize {
        match self {
            Drain::Read { bytes, .. } => *bytes,
            _ => 0,
        }
    }
}

/// Outcome of feeding bytes directly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Feed {
    /// Bytes taken from the input (less than its length only under `Hold`)
    pub consumed: usize,
    /// Lines completed by this feed
    pub lines: usize,
}

/// Readiness of a stream descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Idle,
    Readable,
    HangUp,
}

/// Accumulator plus completed-line history for one output stream
#[derive(Debug)]
pub struct StreamBuffer {
    kind: StreamKind,
    buffer: Box<[u8]>,
    size: usize,
    lines: Vec<String>,
    line_count: usize,
    history_bytes: usize,
    overflow: OverflowPolicy,
}

impl StreamBuffer {
    pub fn new(kind: StreamKind, capacity: usize) -> Self {
        Self {
            kind,
            buffer: vec![0u8; capacity.max(1)].into_boxed_slice(),
            size: 0,
            lines: Vec::new(),
            line_count: 0,
            history_bytes: 0,
            overflow: OverflowPolicy::default(),
        }
    }

    pub fn from_config(kind: StreamKind, config: &StreamConfig) -> Self {
        Self::new(kind, config.capacity).with_overflow(config.overflow)
    }

    pub fn with_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes of the pending unterminated fragment
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.size
    }

    /// The pending unterminated fragment
    pub fn pending(&self) -> &[u8] {
        &self.buffer[..self.size]
    }

    /// Completed lines, oldest first
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Last `n` completed lines
    pub fn tail(&self, n: usize) -> &[String] {
        &self.lines[self.lines.len().saturating_sub(n)..]
    }

    /// Number of lines added since the last clear
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    /// Total text bytes held in the history
    pub fn history_bytes(&self) -> usize {
        self.history_bytes
    }

    /// Drop the fragment and the whole history
    pub fn clear(&mut self) {
        self.size = 0;
        self.lines.clear();
        self.line_count = 0;
        self.history_bytes = 0;
    }

    pub(crate) fn push_line(&mut self, line: String) {
        self.history_bytes += line.len();
        self.line_count += 1;
        self.lines.push(line);
    }

    /// Append bytes as if they had been read, reassembling lines
    pub fn feed(&mut self, mut data: &[u8]) -> Feed {
        let mut feed = Feed::default();
        while !data.is_empty() {
            if self.remaining() == 0 {
                match self.relieve_overflow() {
                    Some(lines) => feed.lines += lines,
                    None => break,
                }
            }
            let n = self.remaining().min(data.len());
            self.buffer[self.size..self.size + n].copy_from_slice(&data[..n]);
            self.size += n;
            data = &data[n..];
            feed.consumed += n;
            feed.lines += self.extract_lines();
        }
        feed
    }

    /// One non-blocking read attempt on `source`
    pub fn drain<R: Read + AsRawFd>(&mut self, source: &mut R, timeout: Duration) -> Result<Drain> {
        let mut split = 0;
        if self.remaining() == 0 {
            match self.relieve_overflow() {
                Some(lines) => split = lines,
                None => return Ok(Drain::Full),
            }
        }

        match poll_readable(source.as_raw_fd(), timeout) {
            Ok(Readiness::Idle) if split > 0 => Ok(Drain::Read { bytes: 0, lines: split }),
            Ok(Readiness::Idle) => Ok(Drain::Idle),
            Ok(Readiness::HangUp) => Err(self.hang_up()),
            Ok(Readiness::Readable) => {
                let n = match source.read(&mut self.buffer[self.size..]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Drain::Idle),
                    Err(e) => {
                        error!("read() {} failed: {}", self.name(), e);
                        return Err(e.into());
                    }
                };
                if n == 0 {
                    return Err(self.hang_up());
                }
                self.size += n;
                let lines = split + self.extract_lines();
                debug!("{} read {} bytes, {} lines, {} pending", self.name(), n, lines, self.size);
                Ok(Drain::Read { bytes: n, lines })
            }
            Err(e) => {
                error!("poll() {} failed: {}", self.name(), e);
                Err(e.into())
            }
        }
    }

    fn hang_up(&mut self) -> Error {
        error!("{}: {}", self.name(), HANGUP_SENTINEL);
        self.push_line(HANGUP_SENTINEL.to_string());
        Error::ChildUnresponsive(self.name().to_string())
    }

    /// Make room in a full accumulator, returning the lines it emitted;
    /// `None` when the policy is to hold
    fn relieve_overflow(&mut self) -> Option<usize> {
        match self.overflow {
            OverflowPolicy::Hold => None,
            OverflowPolicy::Drop => {
                warn!("{} accumulator full, dropping {} byte fragment", self.name(), self.size);
                self.size = 0;
                Some(0)
            }
            OverflowPolicy::Split => {
                debug!("{} accumulator full, splitting {} byte fragment", self.name(), self.size);
                let line = String::from_utf8_lossy(&self.buffer[..self.size]).into_owned();
                self.push_line(line);
                self.size = 0;
                Some(1)
            }
        }
    }

    /// Move every complete line into the history and compact the residue
    fn extract_lines(&mut self) -> usize {
        let mut start = 0;
        let mut found = Vec::new();
        for (i, &b) in self.buffer[..self.size].iter().enumerate() {
            if b == b'\n' {
                found.push(String::from_utf8_lossy(&self.buffer[start..i]).into_owned());
                start = i + 1;
            }
        }

        let count = found.len();
        for line in found {
            self.push_line(line);
        }

        if start < self.size {
            let rem = self.size - start;
            if start > 0 {
                self.buffer.copy_within(start..self.size, 0);
                debug!("{} moved {} bytes from {} to start", self.name(), rem, start);
            }
            self.size = rem;
        } else {
            self.size = 0;
        }
        count
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new(StreamKind::Stdout, DEFAULT_STREAM_CAPACITY)
    }
}

fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<Readiness> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: `pfd` is a single valid pollfd that outlives the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::Idle);
        }
        return Err(err);
    }
    if rc == 0 {
        return Ok(Readiness::Idle);
    }

    // Data still queued before a close is read first; the close shows up next time.
    if pfd.revents & libc::POLLIN != 0 {
        Ok(Readiness::Readable)
    } else if pfd.revents & libc::POLLHUP != 0 {
        Ok(Readiness::HangUp)
    } else if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("unhandled poll revents {:#x}", pfd.revents),
        ))
    } else {
        Ok(Readiness::Idle)
    }
}
