//! Newline-delimited JSON framing over an async byte source.
//!
//! [`LineFramer`] is a pure reassembly buffer: the lines it yields depend only
//! on the bytes pushed, never on how they were chunked. [`RecordReader`]
//! drives it from an [`AsyncRead`] with an idle timeout per read and a cap on
//! the number of lines a single turn may produce.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::errors::ChannelError;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Reassembles newline-terminated lines from arbitrary byte chunks.
#[derive(Debug)]
pub struct LineFramer {
    partial: Vec<u8>,
    ready: VecDeque<Vec<u8>>,
    max_line_bytes: usize,
    overflowed: bool,
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            partial: Vec::new(),
            ready: VecDeque::new(),
            max_line_bytes,
            overflowed: false,
        }
    }

    /// Append bytes. Complete lines become available through [`next_line`].
    ///
    /// Once a line exceeds the byte limit the framer stops accepting input;
    /// lines completed before the oversized one are still yielded first.
    ///
    /// [`next_line`]: LineFramer::next_line
    pub fn push(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            let line = std::mem::take(&mut self.partial);
            if line.len() > self.max_line_bytes {
                self.overflowed = true;
                return;
            }
            self.ready.push_back(line);
        }
        self.partial.extend_from_slice(rest);
        if self.partial.len() > self.max_line_bytes {
            self.overflowed = true;
            self.partial = Vec::new();
        }
    }

    /// Flush an unterminated final line when the source closes.
    pub fn finish(&mut self) {
        if !self.overflowed && !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.ready.push_back(line);
        }
    }

    pub fn next_line(&mut self) -> Option<Result<Vec<u8>, ChannelError>> {
        if let Some(line) = self.ready.pop_front() {
            return Some(Ok(line));
        }
        if self.overflowed {
            return Some(Err(ChannelError::LineTooLong {
                limit: self.max_line_bytes,
            }));
        }
        None
    }
}

/// Decode one line into a JSON record.
///
/// Blank lines yield `None` silently; non-UTF-8 and malformed JSON yield `None`
/// with a warning. Neither ends the stream.
pub fn decode_line(line: &[u8]) -> Option<Value> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => {
            warn!(error = %e, bytes = line.len(), "skipping non-UTF-8 line from assistant");
            return None;
        }
    };
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, line = %preview(text), "skipping malformed JSON line from assistant");
            None
        }
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

fn preview(text: &str) -> String {
    if text.chars().count() <= 120 {
        text.to_string()
    } else {
        let head: String = text.chars().take(120).collect();
        format!("{}...", head)
    }
}

/// Lazy sequence of decoded records read from the assistant's stdout.
pub struct RecordReader<R> {
    source: R,
    framer: LineFramer,
    idle_timeout: Duration,
    max_lines: usize,
    lines_seen: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(source: R, idle_timeout: Duration, max_lines: usize, max_line_bytes: usize) -> Self {
        Self {
            source,
            framer: LineFramer::new(max_line_bytes),
            idle_timeout,
            max_lines,
            lines_seen: 0,
            eof: false,
        }
    }

    /// Non-blank lines consumed so far.
    pub fn lines_seen(&self) -> usize {
        self.lines_seen
    }

    /// Next decoded record, `Ok(None)` once the source has closed.
    ///
    /// Fails when a single read waits longer than the idle timeout, when the
    /// line cap is exceeded, or when a line exceeds the byte limit.
    pub async fn next_record(&mut self) -> Result<Option<Value>, ChannelError> {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            while let Some(line) = self.framer.next_line() {
                let line = line?;
                if is_blank(&line) {
                    continue;
                }
                self.lines_seen += 1;
                if self.lines_seen > self.max_lines {
                    return Err(ChannelError::LineLimitExceeded {
                        limit: self.max_lines,
                    });
                }
                if let Some(record) = decode_line(&line) {
                    return Ok(Some(record));
                }
            }

            if self.eof {
                return Ok(None);
            }

            let read = tokio::time::timeout(self.idle_timeout, self.source.read(&mut buf)).await;
            match read {
                Err(_) => {
                    return Err(ChannelError::IdleTimeout {
                        secs: self.idle_timeout.as_secs(),
                    });
                }
                Ok(Err(e)) => return Err(ChannelError::Io(e)),
                Ok(Ok(0)) => {
                    debug!(lines = self.lines_seen, "assistant stdout closed");
                    self.eof = true;
                    self.framer.finish();
                }
                Ok(Ok(n)) => self.framer.push(&buf[..n]),
            }
        }
    }
}
