//! Command/response execution and unsolicited-event dispatch for one
//! half-duplex serial link.
//!
//! At most one command is in flight per transport; the execution lock
//! serializes callers. Multi-step sequences that must not interleave with
//! other commands (size announcement, payload streaming, completion wait)
//! hold an [`Exchange`] guard across all steps. Every line pulled off the
//! wire is first tested against the URC rule table; matched lines are
//! dispatched inline and never count towards a pending response.

pub mod response;
pub mod urc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, Instant};
use embedded_io_async::{Error as _, ErrorKind, Read, Write};
use heapless::{Deque, Vec};

use crate::config::{self, TransportConfig};
use crate::error::Error;
use response::{AtRequest, AtResponse};
use urc::{UrcHandler as _, UrcRule, UrcTable};

const CRLF: &[u8] = b"\r\n";

pub struct AtTransport<'a, RW> {
    io: Mutex<CriticalSectionRawMutex, Io<RW>>,
    urc: UrcTable<'a>,
    config: TransportConfig,
}

struct Io<RW> {
    dev: RW,
    /// Wire bytes not yet consumed by line assembly.
    pending: Deque<u8, { config::RECV_BUF_LEN }>,
    /// Line under assembly. Survives a cancelled read so the next caller
    /// resumes mid-line instead of tearing the stream.
    line: Vec<u8, { config::LINE_LEN_MAX }>,
}

enum LineEnd {
    Newline,
    EndMark,
    Urc,
}

impl<RW: Read + Write> Io<RW> {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.dev.write_all(bytes).await.map_err(Error::device)
    }

    /// Pull at least one byte from the device into `pending`.
    async fn fill(&mut self, deadline: Option<Instant>) -> Result<(), Error> {
        let mut chunk = [0u8; 64];
        let n = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(Error::Timeout);
                }
                match with_timeout(d - now, self.dev.read(&mut chunk)).await {
                    Ok(r) => r.map_err(Error::device)?,
                    Err(_) => return Err(Error::Timeout),
                }
            }
            None => self.dev.read(&mut chunk).await.map_err(Error::device)?,
        };
        if n == 0 {
            return Err(Error::Device(ErrorKind::Other));
        }
        for &b in &chunk[..n] {
            if self.pending.push_back(b).is_err() {
                warn!("receive buffer overflow, byte dropped");
            }
        }
        Ok(())
    }

    async fn read_byte(&mut self, deadline: Option<Instant>) -> Result<u8, Error> {
        loop {
            if let Some(b) = self.pending.pop_front() {
                return Ok(b);
            }
            self.fill(deadline).await?;
        }
    }

    /// Assemble one line, testing the URC table on every byte so prompt
    /// style codes without a line ending still match. A URC line is
    /// dispatched (payload drained first) before this returns.
    async fn read_line(
        &mut self,
        urc: &UrcTable<'_>,
        end_mark: Option<&[u8]>,
        deadline: Option<Instant>,
    ) -> Result<LineEnd, Error> {
        loop {
            let b = self.read_byte(deadline).await?;
            if self.line.push(b).is_err() {
                error!("line exceeds {} bytes, dropped", config::LINE_LEN_MAX);
                self.line.clear();
                return Err(Error::Exhausted);
            }
            if let Some(rule) = urc.matches(&self.line) {
                self.dispatch_urc(rule, deadline).await?;
                return Ok(LineEnd::Urc);
            }
            if self.line.ends_with(CRLF) {
                return Ok(LineEnd::Newline);
            }
            if let Some(m) = end_mark {
                if !m.is_empty() && self.line.ends_with(m) {
                    return Ok(LineEnd::EndMark);
                }
            }
        }
    }

    async fn dispatch_urc(&mut self, rule: UrcRule<'_>, deadline: Option<Instant>) -> Result<(), Error> {
        let keep = self.line.len() - rule.suffix.len();
        self.line.truncate(keep);

        // Drain announced payload bytes unconditionally. Skipping this on a
        // handler miss would desynchronize every later line.
        let want = rule.handler.trailing_len(rule.token, &self.line);
        let mut payload: Vec<u8, { config::URC_PAYLOAD_MAX }> = Vec::new();
        let mut dropped = 0usize;
        for _ in 0..want {
            let b = self.read_byte(deadline).await?;
            if payload.push(b).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            error!("urc payload of {} bytes over buffer, {} dropped", want, dropped);
        }

        rule.handler.handle(rule.token, &self.line, &payload);
        self.line.clear();
        Ok(())
    }
}

/// Exclusive use of the link for one logical exchange.
///
/// Obtained from [`AtTransport::begin_exchange`]; nested steps re-enter
/// only through this guard, so a multi-step sequence cannot deadlock
/// against itself and no other caller can interleave bytes. Dropping the
/// guard releases the link.
pub struct Exchange<'x, 'a, RW> {
    io: MutexGuard<'x, CriticalSectionRawMutex, Io<RW>>,
    urc: &'x UrcTable<'a>,
    config: &'x TransportConfig,
}

impl<'x, 'a, RW: Read + Write> Exchange<'x, 'a, RW> {
    /// Write the command line and collect its response.
    ///
    /// Reading ends on the request's terminal condition; the deadline is
    /// absolute over the whole exchange. URC lines seen meanwhile are
    /// dispatched and excluded from the response.
    pub async fn execute(&mut self, req: &AtRequest<'_>) -> Result<AtResponse, Error> {
        if req.end_mark.map_or(false, |m| m.is_empty() || m.len() > 2) {
            return Err(Error::InvalidArgument);
        }

        debug!("exec: {}", req.cmd);
        self.io.write_all(req.cmd.as_bytes()).await?;
        self.io.write_all(CRLF).await?;

        let timeout = req.timeout.unwrap_or(self.config.cmd_timeout);
        let deadline = Instant::now() + timeout;
        let mut resp = AtResponse::new();

        loop {
            let end = match self.io.read_line(self.urc, req.end_mark, Some(deadline)).await {
                Ok(end) => end,
                Err(Error::Timeout) => {
                    error!("command timed out: {}", req.cmd);
                    return Err(Error::Timeout);
                }
                Err(e) => return Err(e),
            };

            match end {
                LineEnd::Urc => continue,
                LineEnd::EndMark => {
                    resp.push_line(&self.io.line)?;
                    self.io.line.clear();
                    return Ok(resp);
                }
                LineEnd::Newline => {
                    let stripped = self.io.line.len() - CRLF.len();
                    self.io.line.truncate(stripped);
                    if self.io.line.is_empty() {
                        continue;
                    }

                    let is_ok = self.io.line.starts_with(b"OK");
                    let is_err = contains(&self.io.line, b"ERROR");
                    let stored = resp.push_line(&self.io.line);
                    self.io.line.clear();
                    stored?;

                    if is_err {
                        warn!("command rejected: {}", req.cmd);
                        return Err(Error::Protocol);
                    }
                    if req.lines.is_none() && req.end_mark.is_none() && is_ok {
                        return Ok(resp);
                    }
                    if let Some(n) = req.lines {
                        if resp.line_count() >= n {
                            return Ok(resp);
                        }
                    }
                }
            }
        }
    }

    /// Low-level passthrough for streaming a payload after a prompt.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<usize, Error> {
        self.io.write_all(bytes).await?;
        Ok(bytes.len())
    }

    /// Keep the receive path moving until `sig` fires or the deadline
    /// passes. The waiter itself drives the read loop, so the event can
    /// only arrive through URC dispatch happening on this stack; the
    /// signal is checked after every dispatched line and reading stops at
    /// that exact boundary.
    pub async fn wait_event<T: Send>(
        &mut self,
        sig: &Signal<CriticalSectionRawMutex, T>,
        timeout: Duration,
    ) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(v) = sig.try_take() {
                return Ok(v);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            match self.io.read_line(self.urc, None, Some(deadline)).await {
                Ok(LineEnd::Urc) => {}
                Ok(_) => {
                    if !self.io.line.iter().all(|b| *b == b'\r' || *b == b'\n') {
                        debug!("unsolicited line without a rule, dropped");
                    }
                    self.io.line.clear();
                }
                Err(Error::Timeout) => return sig.try_take().ok_or(Error::Timeout),
                Err(e) => return Err(e),
            }
        }
    }

    /// Pull whatever unsolicited traffic is already on the wire, returning
    /// once the link stays quiet for `idle`.
    pub async fn drain(&mut self, idle: Duration) -> Result<(), Error> {
        loop {
            let deadline = Instant::now() + idle;
            match self.io.read_line(self.urc, None, Some(deadline)).await {
                Ok(LineEnd::Urc) => {}
                Ok(_) => {
                    self.io.line.clear();
                }
                Err(Error::Timeout) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<'a, RW: Read + Write> AtTransport<'a, RW> {
    pub fn new(dev: RW, config: TransportConfig) -> Self {
        Self {
            io: Mutex::new(Io {
                dev,
                pending: Deque::new(),
                line: Vec::new(),
            }),
            urc: UrcTable::new(),
            config,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Acquire the link for a multi-step exchange.
    pub async fn begin_exchange(&self) -> Exchange<'_, 'a, RW> {
        Exchange {
            io: self.io.lock().await,
            urc: &self.urc,
            config: &self.config,
        }
    }

    /// Single command convenience wrapper.
    pub async fn execute(&self, req: &AtRequest<'_>) -> Result<AtResponse, Error> {
        self.begin_exchange().await.execute(req).await
    }

    pub async fn send_raw(&self, bytes: &[u8]) -> Result<usize, Error> {
        self.begin_exchange().await.send_raw(bytes).await
    }

    /// Acquire the link and wait for `sig`, pumping URC dispatch
    /// meanwhile.
    pub async fn wait_event<T: Send>(
        &self,
        sig: &Signal<CriticalSectionRawMutex, T>,
        timeout: Duration,
    ) -> Result<T, Error> {
        self.begin_exchange().await.wait_event(sig, timeout).await
    }

    /// Drain pending unsolicited traffic, then release the link. Protocols
    /// that need always-on capture call this from a dedicated loop.
    pub async fn drain(&self, idle: Duration) -> Result<(), Error> {
        self.begin_exchange().await.drain(idle).await
    }

    /// Replace the whole rule table.
    pub fn set_urc_table(&self, rules: &[UrcRule<'a>]) -> Result<(), Error> {
        self.urc.replace(rules)
    }

    /// Append rules for one feature group.
    pub fn add_urc_rules(&self, rules: &[UrcRule<'a>]) -> Result<(), Error> {
        self.urc.add(rules)
    }

    /// Probe the module with `AT` until it answers, bounded by the retry
    /// budget. Each attempt gets one command timeout.
    pub async fn handshake(&self, retries: u8) -> Result<(), Error> {
        let mut ex = self.begin_exchange().await;
        for attempt in 1..=retries {
            match ex.execute(&AtRequest::new("AT")).await {
                Ok(_) => return Ok(()),
                Err(e) => warn!("module probe {} failed: {:?}", attempt, e),
            }
        }
        Err(Error::Timeout)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
