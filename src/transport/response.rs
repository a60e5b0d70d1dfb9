//! Request descriptors and response line storage.

use embassy_time::Duration;
use heapless::Vec;

use crate::config;
use crate::error::Error;

/// What one command expects back and how long it may take.
///
/// Without a line count or end mark the response ends on the module's
/// result code (`OK`, or any line carrying `ERROR`). Without an explicit
/// timeout the transport's configured command timeout applies.
pub struct AtRequest<'a> {
    pub(crate) cmd: &'a str,
    pub(crate) timeout: Option<Duration>,
    pub(crate) lines: Option<usize>,
    pub(crate) end_mark: Option<&'a [u8]>,
}

impl<'a> AtRequest<'a> {
    pub fn new(cmd: &'a str) -> Self {
        Self {
            cmd,
            timeout: None,
            lines: None,
            end_mark: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stop after this many stored lines instead of waiting for a result
    /// code.
    pub fn lines(mut self, count: usize) -> Self {
        self.lines = Some(count);
        self
    }

    /// Treat this byte sequence as the terminator, matched without a line
    /// ending. Prompt style exchanges (`>`) use this. At most two bytes.
    pub fn end_mark(mut self, mark: &'a [u8]) -> Self {
        self.end_mark = Some(mark);
        self
    }
}

/// Lines collected for one command, terminators stripped.
#[derive(Debug, Default)]
pub struct AtResponse {
    buf: Vec<u8, { config::RESP_BUF_LEN }>,
    bounds: Vec<(u16, u16), { config::RESP_LINE_MAX }>,
}

impl AtResponse {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_line(&mut self, line: &[u8]) -> Result<(), Error> {
        if self.bounds.is_full() {
            return Err(Error::Exhausted);
        }
        let start = self.buf.len();
        self.buf
            .extend_from_slice(line)
            .map_err(|_| Error::Exhausted)?;
        // both fit in u16 by construction, the buffer is smaller
        self.bounds
            .push((start as u16, self.buf.len() as u16))
            .map_err(|_| Error::Exhausted)?;
        Ok(())
    }

    pub fn line_count(&self) -> usize {
        self.bounds.len()
    }

    pub fn line(&self, idx: usize) -> Option<&str> {
        let &(start, end) = self.bounds.get(idx)?;
        core::str::from_utf8(&self.buf[start as usize..end as usize]).ok()
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        (0..self.line_count()).filter_map(|i| self.line(i))
    }

    /// First line beginning with `prefix`.
    pub fn line_starting_with(&self, prefix: &str) -> Option<&str> {
        self.lines().find(|l| l.starts_with(prefix))
    }

    /// Remainder of the first line beginning with `prefix`, trimmed.
    pub fn field_after(&self, prefix: &str) -> Option<&str> {
        self.line_starting_with(prefix)
            .map(|l| l[prefix.len()..].trim())
    }
}
