//! Vendor command vocabularies.
//!
//! The link mechanics never hardcode a command string. Each feature group
//! consumes a table implementing one of these traits, and a module
//! variant registers exactly the groups it supports; querying anything
//! else fails with [`Error::Unsupported`](crate::error::Error) before any
//! I/O happens.

use embassy_time::Duration;
use heapless::String;
use no_std_net::IpAddr;

use crate::config::CMD_LEN_MAX;
use crate::error::Error;
use crate::netconn::NetconnType;
use crate::transport::response::AtResponse;

/// Scratch buffer command formatters write into.
pub type CmdBuf = String<CMD_LEN_MAX>;

/// A fixed query: the command to send and the line prefix carrying the
/// answer. An empty prefix selects the first response line.
#[derive(Debug, Clone, Copy)]
pub struct Query {
    pub cmd: &'static str,
    pub prefix: &'static str,
}

/// One step of the vendor attach script run at bring-up.
#[derive(Debug, Clone, Copy)]
pub struct BringupCmd {
    pub cmd: &'static str,
    pub timeout: Duration,
}

/// Device identity and firmware queries.
pub trait GeneralCmds: Sync {
    fn imei(&self) -> Query;
    fn imsi(&self) -> Query;
    fn iccid(&self) -> Query;
    fn firmware(&self) -> Query;
}

/// Radio/network service state queries. The response grammars follow the
/// 3GPP formats shared by every supported module.
pub trait NetServCmds: Sync {
    fn csq(&self) -> Query;
    fn attach(&self) -> Query;
    fn registration(&self) -> Query;
}

/// Local address configuration.
pub trait IfconfigCmds: Sync {
    fn ipaddr(&self) -> Query;
    fn parse_ipaddr(&self, line: &str) -> Option<IpAddr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PingReply {
    pub time_ms: u32,
    pub ttl: u8,
}

pub trait PingCmds: Sync {
    fn ping_cmd(&self, out: &mut CmdBuf, host: &str, timeout_s: u32) -> Result<(), Error>;
    /// `(prefix, suffix)` of the reply line.
    fn rule(&self) -> (&'static str, &'static str);
    fn parse_reply(&self, line: &str) -> Option<PingReply>;
}

/// How a pool slot gets its on-module socket id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    /// The caller picks a free slot id, optionally verified against module
    /// state with a status query first.
    CallerAssigned { verify: bool },
    /// The module assigns the id in its create response.
    ModuleAssigned,
}

/// Payload framing on the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Raw,
    Hex,
}

/// Classification of a netconn-owned unsolicited line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetconnUrcKind {
    /// Connect outcome carrying `(id, result)`.
    Open,
    /// Send completion, usually without a connection id.
    SendResult,
    /// Multiplexed events: remote close, inbound data, name resolution.
    Event,
}

#[derive(Debug, Clone, Copy)]
pub struct NetconnRule {
    pub prefix: &'static str,
    pub suffix: &'static str,
    pub kind: NetconnUrcKind,
}

/// Socket vocabulary of one vendor.
///
/// Formatters write the exact command line; parsers pick apart the
/// unsolicited grammar. Defaults mark the hooks a vendor does not have.
pub trait NetconnCmds: Sync {
    fn strategy(&self) -> AllocStrategy;

    /// Status probe for a caller-assigned id.
    fn verify_cmd(&self, out: &mut CmdBuf, id: u8) -> Result<(), Error> {
        let _ = (out, id);
        Err(Error::Unsupported)
    }

    /// Whether the status response shows the id as already taken.
    fn verify_in_use(&self, resp: &AtResponse) -> bool {
        let _ = resp;
        false
    }

    /// Socket-creation exchange. Vendors that open the socket during
    /// connect return `Ok(false)` and no command is issued.
    fn create_cmd(&self, out: &mut CmdBuf, ty: NetconnType) -> Result<bool, Error>;

    /// Id assigned by the module, for [`AllocStrategy::ModuleAssigned`].
    fn parse_created(&self, resp: &AtResponse) -> Option<u8> {
        let _ = resp;
        None
    }

    fn connect_cmd(
        &self,
        out: &mut CmdBuf,
        id: u8,
        ty: NetconnType,
        addr: &IpAddr,
        port: u16,
    ) -> Result<(), Error>;

    fn send_cmd(&self, out: &mut CmdBuf, id: u8, len: usize) -> Result<(), Error>;

    /// Prompt announcing the module is ready for payload bytes.
    fn send_prompt(&self) -> &'static [u8] {
        b">"
    }

    fn payload_encoding(&self) -> PayloadEncoding {
        PayloadEncoding::Raw
    }

    /// Largest payload one send command may carry.
    fn max_send(&self) -> usize {
        1460
    }

    fn close_cmd(&self, out: &mut CmdBuf, id: u8) -> Result<(), Error>;

    fn resolve_cmd(&self, out: &mut CmdBuf, host: &str) -> Result<(), Error> {
        let _ = (out, host);
        Err(Error::Unsupported)
    }

    /// Unsolicited lines this vocabulary owns.
    fn rules(&self) -> &'static [NetconnRule];

    /// `(id, success)` from a connect outcome line.
    fn parse_connect_result(&self, line: &str) -> Option<(u8, bool)> {
        let _ = line;
        None
    }

    /// Send completion verdict; `None` when the line is not one.
    fn parse_send_result(&self, line: &str) -> Option<bool> {
        let _ = line;
        None
    }

    /// Connection id from a remote-close line.
    fn parse_closed(&self, line: &str) -> Option<u8> {
        let _ = line;
        None
    }

    /// `(id, announced byte count)` from a data-available line.
    fn parse_recv(&self, line: &str) -> Option<(u8, usize)> {
        let _ = line;
        None
    }

    /// Resolved address from a name-resolution line.
    fn parse_dns(&self, line: &str) -> Option<IpAddr> {
        let _ = line;
        None
    }
}

/// The capability table of one module variant: a slot per feature group,
/// absent when the variant does not support it.
pub trait CommandSet: Sync {
    fn general(&self) -> Option<&dyn GeneralCmds> {
        None
    }

    fn net_service(&self) -> Option<&dyn NetServCmds> {
        None
    }

    fn ifconfig(&self) -> Option<&dyn IfconfigCmds> {
        None
    }

    /// Commands run once after the probe succeeds (network attach etc).
    fn bringup(&self) -> &'static [BringupCmd] {
        &[]
    }

    /// Whether this variant carries the registration/messaging session
    /// engine.
    fn has_session(&self) -> bool {
        false
    }
}
