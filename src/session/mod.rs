//! Registration/messaging session protocol (CTM2M).
//!
//! At most one live session exists per resources instance; create and
//! destroy are paired and mutually exclusive. Unsolicited traffic is
//! split two ways: the send acknowledgement is correlated inline through
//! a signal, while receive/notify/request lines are copied into owned
//! buffers and queued for the worker so user callbacks never run on the
//! receive path.

mod runner;

pub use runner::SessionRunner;

use core::cell::RefCell;
use core::fmt::Write as _;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embedded_io_async::{Read, Write};
use heapless::{String, Vec};
use portable_atomic::{AtomicBool, Ordering};

use crate::cmd::{CmdBuf, CommandSet as _};
use crate::config::{self, SessionConfig};
use crate::error::Error;
use crate::hex;
use crate::module::Module;
use crate::transport::response::AtRequest;
use crate::transport::urc::{UrcHandler, UrcRule};
use crate::transport::AtTransport;

const LIFETIME_MIN_S: u32 = 300;
const SERVER_ADDR_MAX: usize = 15;

pub(crate) type LineBuf = Vec<u8, { config::SESSION_LINE_MAX }>;

/// Registration parameters handed to `create`.
pub struct SessionParams<'p> {
    /// Server address, dotted quad text.
    pub server: &'p str,
    pub port: u16,
    /// Registration lifetime in seconds, at least 300.
    pub lifetime: u32,
    /// Optional object instance list, `</3303/0>,</3303/1>` style.
    pub objects: Option<&'p str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendMode {
    Con = 0,
    Non = 1,
    NonRai = 2,
    ConRai = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BindingMode {
    UqMode = 1,
    UMode = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NotifyKind {
    Register,
    Observe,
    Update,
    Ping,
    Deregister,
    Send,
    LinkStatus,
}

/// Platform status codes carried by notify lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NotifyStatus {
    Success,
    Timeout,
    NotSent,
    ReceivedRst,
    InvalidParam,
    UnknownError,
    AuthFailed,
    NotLoggedIn,
    VersionMismatch,
    SessionInvalid,
    SessionLoadFailed,
    EngineAbnormal,
    TauDue,
    AlreadySent,
    MissingObject19,
}

impl NotifyStatus {
    pub(crate) fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::Timeout,
            2 => Self::NotSent,
            9 => Self::ReceivedRst,
            10 => Self::InvalidParam,
            11 => Self::UnknownError,
            13 => Self::AuthFailed,
            14 => Self::NotLoggedIn,
            22 => Self::VersionMismatch,
            24 => Self::SessionInvalid,
            25 => Self::SessionLoadFailed,
            26 => Self::EngineAbnormal,
            28 => Self::TauDue,
            31 => Self::AlreadySent,
            32 => Self::MissingObject19,
            _ => return None,
        })
    }
}

/// Server notification delivered through the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Notify {
    pub kind: NotifyKind,
    pub status: NotifyStatus,
    pub msg_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    Read,
    Observe,
    Write,
    WritePartial,
    WriteAttribute,
    Discover,
    Execute,
    Create,
    Delete,
}

impl RequestKind {
    pub(crate) fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Read,
            1 => Self::Observe,
            2 => Self::Write,
            3 => Self::WritePartial,
            4 => Self::WriteAttribute,
            5 => Self::Discover,
            6 => Self::Execute,
            7 => Self::Create,
            8 => Self::Delete,
            _ => return None,
        })
    }
}

/// Server command delivered through the worker, borrowed from the queued
/// line for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct Request<'r> {
    pub msg_id: i32,
    pub kind: RequestKind,
    pub token: &'r str,
    pub uri: &'r str,
    pub observe: Option<i32>,
    pub data_format: Option<i32>,
    pub data: Option<&'r str>,
}

/// Reply to a server command.
pub struct Respond<'p> {
    pub msg_id: i32,
    pub token: &'p str,
    pub resp_code: i32,
    pub uri: &'p str,
    pub observe: i32,
    pub data_format: Option<i32>,
    pub data: Option<&'p [u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UeMode {
    IdAuth = 1,
    AutoTauUpdate = 2,
    UqMode = 3,
    AutoHeartbeat = 5,
    WakeupNotify = 6,
    ProtocolMode = 7,
}

#[derive(Debug, Clone, Copy)]
pub struct UeConfig {
    pub mode: UeMode,
    pub value: u32,
}

/// Raw mode settings reported by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UeInfo {
    pub auth_mode: i32,
    pub tau_timer_mode: i32,
    pub uq_mode: i32,
    pub ce_mode: i32,
    pub heartbeat_mode: i32,
    pub wakeup_mode: i32,
    pub protocol_mode: i32,
}

/// User callbacks. All three run on the worker, never on the receive
/// path.
pub trait SessionEvents: Sync {
    fn on_notify(&self, notify: Notify);
    fn on_request(&self, request: Request<'_>);
    fn on_receive(&self, data: &[u8]);
}

pub(crate) enum SessionWork {
    Notify(LineBuf),
    Request(LineBuf),
    Receive(LineBuf),
    Shutdown,
}

const TOKEN_SENT: u8 = 0;
const TOKEN_DEFER: u8 = 1;

/// Shared state backing one session slot. Caller owned; the singleton
/// discipline lives in the `active` flag, so tests can run independent
/// sessions from independent resources.
pub struct SessionResources<'cb> {
    pub(crate) queue: Channel<CriticalSectionRawMutex, SessionWork, { config::SESSION_QUEUE_DEPTH }>,
    pub(crate) sent: Signal<CriticalSectionRawMutex, i32>,
    pub(crate) active: AtomicBool,
    rules_installed: AtomicBool,
    pub(crate) events: BlockingMutex<CriticalSectionRawMutex, RefCell<Option<&'cb dyn SessionEvents>>>,
}

impl<'cb> SessionResources<'cb> {
    pub const fn new() -> Self {
        Self {
            queue: Channel::new(),
            sent: Signal::new(),
            active: AtomicBool::new(false),
            rules_installed: AtomicBool::new(false),
            events: BlockingMutex::new(RefCell::new(None)),
        }
    }

    pub(crate) fn callbacks(&self) -> Option<&'cb dyn SessionEvents> {
        self.events.lock(|e| *e.borrow())
    }

    fn drain_queue(&self) {
        while self.queue.try_receive().is_ok() {}
    }
}

impl Default for SessionResources<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl UrcHandler for SessionResources<'_> {
    fn handle(&self, token: u8, line: &[u8], _trailing: &[u8]) {
        if !self.active.load(Ordering::Acquire) {
            warn!("session line with no live session, dropped");
            return;
        }
        let Ok(text) = core::str::from_utf8(line) else {
            warn!("non-text session line dropped");
            return;
        };

        if token == TOKEN_SENT {
            match text.strip_prefix("+CTM2MSEND:").and_then(|v| v.trim().parse::<i32>().ok()) {
                Some(id) => self.sent.signal(id),
                None => warn!("unparseable send acknowledgement"),
            }
            return;
        }

        let mut copy = LineBuf::new();
        if copy.extend_from_slice(line).is_err() {
            warn!("session line over {} bytes, dropped", config::SESSION_LINE_MAX);
            return;
        }
        let work = if text.starts_with("+CTM2MRECV:") {
            SessionWork::Receive(copy)
        } else if text.starts_with("+CTM2MCMD:") {
            SessionWork::Request(copy)
        } else if text.starts_with("+CTM2M:") {
            SessionWork::Notify(copy)
        } else {
            debug!("unclassified session line dropped");
            return;
        };

        // Back-pressure is drop-newest: blocking here would stall the
        // transport's receive path for every consumer of the link.
        if self.queue.try_send(work).is_err() {
            warn!("session work queue full, line dropped");
        }
    }
}

fn session_rules<'a>(res: &'a SessionResources<'a>) -> [UrcRule<'a>; 4] {
    [
        UrcRule {
            prefix: "+CTM2MSEND:",
            suffix: "\r\n",
            token: TOKEN_SENT,
            handler: res,
        },
        UrcRule {
            prefix: "+CTM2MRECV:",
            suffix: "\r\n",
            token: TOKEN_DEFER,
            handler: res,
        },
        UrcRule {
            prefix: "+CTM2MCMD:",
            suffix: "\r\n",
            token: TOKEN_DEFER,
            handler: res,
        },
        UrcRule {
            prefix: "+CTM2M:",
            suffix: "\r\n",
            token: TOKEN_DEFER,
            handler: res,
        },
    ]
}

/// Live session handle.
pub struct Ctm2m<'a, RW> {
    transport: &'a AtTransport<'a, RW>,
    res: &'a SessionResources<'a>,
    lock: Mutex<CriticalSectionRawMutex, ()>,
    config: SessionConfig,
}

impl<'a, RW: Read + Write> Ctm2m<'a, RW> {
    /// Claim the session slot, wire its unsolicited rules and push the
    /// registration parameters to the module.
    ///
    /// A second create while one instance is live fails without side
    /// effects. Failure after the slot is claimed unwinds in reverse
    /// order, releasing the slot last.
    pub async fn create<const N: usize>(
        module: &'a Module<'a, RW, N>,
        res: &'a SessionResources<'a>,
        params: &SessionParams<'_>,
        events: &'a dyn SessionEvents,
        config: SessionConfig,
    ) -> Result<(Ctm2m<'a, RW>, SessionRunner<'a>), Error> {
        if !module.command_set().has_session() {
            return Err(Error::Unsupported);
        }
        if params.server.is_empty() || params.server.len() > SERVER_ADDR_MAX {
            error!("session server address invalid");
            return Err(Error::InvalidArgument);
        }
        if params.lifetime < LIFETIME_MIN_S || params.lifetime > i32::MAX as u32 {
            error!("session lifetime outside [{}, {}]", LIFETIME_MIN_S, i32::MAX as u32);
            return Err(Error::InvalidArgument);
        }

        if res
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!("a live session already exists, destroy it first");
            return Err(Error::Exhausted);
        }

        // rules are installed once and stay inert while no session is live
        if !res.rules_installed.load(Ordering::Acquire) {
            if let Err(e) = module.transport().add_urc_rules(&session_rules(res)) {
                res.active.store(false, Ordering::Release);
                return Err(e);
            }
            res.rules_installed.store(true, Ordering::Release);
        }

        res.events.lock(|e| *e.borrow_mut() = Some(events));
        res.drain_queue();
        res.sent.reset();

        let mut cmd: CmdBuf = String::new();
        let built = match params.objects {
            Some(objects) => write!(
                cmd,
                "AT+CTM2MSETPM={},{},{},\"{}\"",
                params.server, params.port, params.lifetime, objects
            ),
            None => write!(
                cmd,
                "AT+CTM2MSETPM={},{},{}",
                params.server, params.port, params.lifetime
            ),
        };
        let result = match built {
            Ok(()) => module
                .transport()
                .execute(&AtRequest::new(&cmd).timeout(config.cmd_timeout))
                .await
                .map(|_| ()),
            Err(_) => Err(Error::Exhausted),
        };

        if let Err(e) = result {
            res.events.lock(|e| *e.borrow_mut() = None);
            res.drain_queue();
            res.active.store(false, Ordering::Release);
            error!("session parameter setup failed: {:?}", e);
            return Err(e);
        }

        info!("session up at {}:{}", params.server, params.port);
        Ok((
            Ctm2m {
                transport: module.transport(),
                res,
                lock: Mutex::new(()),
                config,
            },
            SessionRunner::new(res),
        ))
    }

    /// Send an application payload, hex encoded, and return the message
    /// id the module assigned.
    ///
    /// The acknowledgement arrives asynchronously; any stale signal from
    /// a previous timed-out send is cleared before the command goes out,
    /// so the returned id always belongs to this call.
    pub async fn send(&self, payload: &[u8], mode: SendMode) -> Result<i32, Error> {
        if payload.is_empty() || payload.len() > config::SESSION_SEND_MAX {
            return Err(Error::InvalidArgument);
        }
        let mut encoded: Vec<u8, { 2 * config::SESSION_SEND_MAX }> = Vec::new();
        hex::encode_into(payload, &mut encoded)?;

        let _session = self.lock.lock().await;
        self.res.sent.reset();

        {
            let mut ex = self.transport.begin_exchange().await;
            ex.send_raw(b"AT+CTM2MSEND=").await?;
            ex.send_raw(&encoded).await?;

            let mut tail: String<8> = String::new();
            write!(tail, ",{}", mode as u8).map_err(|_| Error::Exhausted)?;
            ex.execute(&AtRequest::new(&tail).timeout(self.config.cmd_timeout))
                .await?;
        }

        // link released, block on the acknowledgement alone
        let id = match self
            .transport
            .wait_event(&self.res.sent, self.config.ack_timeout)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!("send acknowledgement missing: {:?}", e);
                return Err(e);
            }
        };
        debug!("message {} accepted", id);
        Ok(id)
    }

    pub async fn register(&self) -> Result<(), Error> {
        let _session = self.lock.lock().await;
        self.transport
            .execute(&AtRequest::new("AT+CTM2MREG").timeout(self.config.cmd_timeout))
            .await
            .map(|_| ())
    }

    /// Deregister from the platform. Queries the current registration
    /// first and is a no-op when the module already is deregistered, so
    /// the operation is idempotent over network-visible state.
    pub async fn deregister(&self) -> Result<(), Error> {
        let _session = self.lock.lock().await;
        let resp = self
            .transport
            .execute(&AtRequest::new("AT+CTM2MREG?").timeout(self.config.cmd_timeout))
            .await?;
        let stat: i32 = resp
            .field_after("+CTM2MREG:")
            .and_then(|v| v.parse().ok())
            .ok_or(Error::Protocol)?;

        match stat {
            0 => {
                info!("already deregistered, nothing to do");
                Ok(())
            }
            1 => self
                .transport
                .execute(&AtRequest::new("AT+CTM2MDEREG").timeout(self.config.cmd_timeout))
                .await
                .map(|_| ()),
            _ => {
                error!("registration state {} unknown", stat);
                Err(Error::Protocol)
            }
        }
    }

    /// Refresh the registration, optionally rebinding.
    pub async fn update(&self, mode: Option<BindingMode>) -> Result<(), Error> {
        let _session = self.lock.lock().await;
        let mut cmd: CmdBuf = String::new();
        match mode {
            Some(mode) => write!(cmd, "AT+CTM2MUPDATE={}", mode as u8),
            None => write!(cmd, "AT+CTM2MUPDATE"),
        }
        .map_err(|_| Error::Exhausted)?;
        self.transport
            .execute(&AtRequest::new(&cmd).timeout(self.config.cmd_timeout))
            .await
            .map(|_| ())
    }

    /// Answer a server command previously delivered to the request
    /// callback. A payload-bearing reply carries its data hex encoded and
    /// requires the data format.
    pub async fn respond(&self, resp: &Respond<'_>) -> Result<(), Error> {
        if resp.msg_id < 0 || resp.token.is_empty() || resp.uri.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if resp.data.is_some() && resp.data_format.is_none() {
            return Err(Error::InvalidArgument);
        }

        let _session = self.lock.lock().await;
        let mut cmd: String<512> = String::new();
        write!(
            cmd,
            "AT+CTM2MCMDRSP={},{},{},{},{}",
            resp.msg_id, resp.token, resp.resp_code, resp.uri, resp.observe
        )
        .map_err(|_| Error::Exhausted)?;

        if let Some(data) = resp.data {
            let mut encoded: Vec<u8, 256> = Vec::new();
            hex::encode_into(data, &mut encoded)?;
            let text = core::str::from_utf8(&encoded).map_err(|_| Error::Protocol)?;
            write!(cmd, ",{},{}", resp.data_format.unwrap_or(0), text)
                .map_err(|_| Error::Exhausted)?;
        }

        self.transport
            .execute(&AtRequest::new(&cmd).timeout(self.config.cmd_timeout))
            .await
            .map(|_| ())
    }

    pub async fn set_ue_config(&self, cfg: UeConfig) -> Result<(), Error> {
        let _session = self.lock.lock().await;
        let mut cmd: CmdBuf = String::new();
        write!(cmd, "AT+CTM2MSETMOD={},{}", cfg.mode as u8, cfg.value)
            .map_err(|_| Error::Exhausted)?;
        self.transport
            .execute(&AtRequest::new(&cmd).timeout(self.config.cmd_timeout))
            .await
            .map(|_| ())
    }

    pub async fn get_ue_config(&self) -> Result<UeInfo, Error> {
        let _session = self.lock.lock().await;
        let resp = self
            .transport
            .execute(&AtRequest::new("AT+CTM2MSETMOD?").timeout(self.config.cmd_timeout))
            .await?;
        let value = resp.field_after("+CTM2MSETMOD:").ok_or(Error::Protocol)?;
        let fields = seven_ints(value).ok_or(Error::Protocol)?;
        Ok(UeInfo {
            auth_mode: fields[0],
            tau_timer_mode: fields[1],
            uq_mode: fields[2],
            ce_mode: fields[3],
            heartbeat_mode: fields[4],
            wakeup_mode: fields[5],
            protocol_mode: fields[6],
        })
    }

    /// Stop the session: refuse new work, free everything queued but not
    /// yet processed, let the worker exit, release the singleton slot.
    pub fn destroy(self) {
        self.res.active.store(false, Ordering::Release);
        self.res.drain_queue();
        if self.res.queue.try_send(SessionWork::Shutdown).is_err() {
            warn!("worker queue full at shutdown");
        }
        self.res.events.lock(|e| *e.borrow_mut() = None);
        self.res.sent.reset();
        info!("session destroyed");
    }
}

fn seven_ints(s: &str) -> Option<[i32; 7]> {
    let mut out = [0i32; 7];
    let mut it = s.split(',');
    for slot in &mut out {
        *slot = it.next()?.trim().parse().ok()?;
    }
    Some(out)
}
