//! Virtual network connections multiplexed over one command channel.
//!
//! A [`NetconnSet`] drives a fixed pool of slots through the
//! `Null -> Init -> Connect -> Null` lifecycle. Commands go out through
//! the owning transport; completions arrive as unsolicited lines and are
//! turned into per-slot events the blocked operation waits on. Commands
//! on different connections never interleave on the wire because the
//! whole send sequence holds one exchange.

pub mod set;

use embassy_time::{with_timeout, Duration, Instant};
use embedded_io_async::{Read, Write};
use heapless::Vec;
use no_std_net::IpAddr;

use crate::cmd::{
    AllocStrategy, CmdBuf, NetconnCmds, NetconnUrcKind, PayloadEncoding,
};
use crate::config::{self, NetconnConfig};
use crate::error::Error;
use crate::hex;
use crate::transport::response::AtRequest;
use crate::transport::urc::{UrcHandler, UrcRule};
use crate::transport::AtTransport;

pub use set::{NetconnResources, NetconnState, RecvData};
use set::SendTicket;

/// Transport protocol of a virtual connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetconnType {
    Tcp,
    Udp,
}

/// Wakeup posted by the event rules, keyed to one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnEvent {
    Connected,
    ConnectFailed,
    SendOk,
    SendFailed,
}

/// Handle to one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Netconn {
    pub(crate) id: u8,
}

impl Netconn {
    pub fn id(&self) -> u8 {
        self.id
    }
}

/// Send failure carrying how much was flushed before the failing chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SendError {
    pub sent: usize,
    pub source: Error,
}

impl From<SendError> for Error {
    fn from(e: SendError) -> Self {
        e.source
    }
}

const TOKEN_OPEN: u8 = 0;
const TOKEN_SEND: u8 = 1;
const TOKEN_EVENT: u8 = 2;

fn token_for(kind: NetconnUrcKind) -> u8 {
    match kind {
        NetconnUrcKind::Open => TOKEN_OPEN,
        NetconnUrcKind::SendResult => TOKEN_SEND,
        NetconnUrcKind::Event => TOKEN_EVENT,
    }
}

/// Operations over a pool of virtual connections.
pub struct NetconnSet<'a, const N: usize> {
    res: &'a NetconnResources<N>,
    cmds: &'a dyn NetconnCmds,
    config: NetconnConfig,
}

impl<'a, const N: usize> NetconnSet<'a, N> {
    pub fn new(
        res: &'a NetconnResources<N>,
        cmds: &'a dyn NetconnCmds,
        config: NetconnConfig,
    ) -> Self {
        Self { res, cmds, config }
    }

    /// Register this pool's unsolicited rules on the transport.
    pub fn install<RW: Read + Write>(
        &'a self,
        transport: &AtTransport<'a, RW>,
    ) -> Result<(), Error> {
        for rule in self.cmds.rules() {
            transport.add_urc_rules(&[UrcRule {
                prefix: rule.prefix,
                suffix: rule.suffix,
                token: token_for(rule.kind),
                handler: self,
            }])?;
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Connections currently allocated.
    pub fn len(&self) -> usize {
        self.res.live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observable lifecycle state of a handle.
    pub fn state(&self, conn: Netconn) -> NetconnState {
        self.res
            .slot_state(conn.id as usize)
            .unwrap_or(NetconnState::Null)
    }

    /// Module-side connect id of a slot, `-1` while unallocated.
    pub fn connect_id(&self, conn: Netconn) -> i8 {
        self.res
            .with_slot(conn.id as usize, |s| s.connect_id)
            .unwrap_or(-1)
    }

    /// Remote endpoint a connection is bound to.
    pub fn peer(&self, conn: Netconn) -> Option<(IpAddr, u16)> {
        self.res
            .with_slot(conn.id as usize, |s| s.remote_ip.map(|ip| (ip, s.remote_port)))
            .flatten()
    }

    /// Allocate a slot and create the socket on the module.
    ///
    /// On failure the slot stays free. A full pool reports exhaustion
    /// without touching live connections.
    pub async fn create<RW: Read + Write>(
        &self,
        transport: &AtTransport<'_, RW>,
        ty: NetconnType,
    ) -> Result<Netconn, Error> {
        let _pool = self.res.lock.lock().await;

        let id = match self.cmds.strategy() {
            AllocStrategy::CallerAssigned { verify } => {
                let mut picked = None;
                for id in 0..N as u8 {
                    if self.res.slot_state(id as usize) != Some(NetconnState::Null) {
                        continue;
                    }
                    if verify {
                        let mut cmd = CmdBuf::new();
                        self.cmds.verify_cmd(&mut cmd, id)?;
                        let resp = transport.execute(&AtRequest::new(&cmd)).await?;
                        if self.cmds.verify_in_use(&resp) {
                            debug!("id {} busy on the module, skipped", id);
                            continue;
                        }
                    }
                    picked = Some(id);
                    break;
                }
                let id = match picked {
                    Some(id) => id,
                    None => {
                        error!("netconn pool exhausted");
                        return Err(Error::Exhausted);
                    }
                };
                let mut cmd = CmdBuf::new();
                if self.cmds.create_cmd(&mut cmd, ty)? {
                    transport.execute(&AtRequest::new(&cmd)).await?;
                }
                id
            }
            AllocStrategy::ModuleAssigned => {
                if self.res.live_count() >= N {
                    error!("netconn pool exhausted");
                    return Err(Error::Exhausted);
                }
                let mut cmd = CmdBuf::new();
                if !self.cmds.create_cmd(&mut cmd, ty)? {
                    return Err(Error::Unsupported);
                }
                let resp = transport.execute(&AtRequest::new(&cmd)).await?;
                let id = match self.cmds.parse_created(&resp) {
                    Some(id) if (id as usize) < N => id,
                    Some(id) => {
                        error!("module assigned id {} outside the pool", id);
                        return Err(Error::Protocol);
                    }
                    None => return Err(Error::Protocol),
                };
                if self.res.slot_state(id as usize) != Some(NetconnState::Null) {
                    error!("module assigned id {} already live", id);
                    return Err(Error::Protocol);
                }
                id
            }
        };

        while self.res.queues[id as usize].try_receive().is_ok() {}
        self.res.events[id as usize].reset();
        self.res.with_slot(id as usize, |s| {
            s.connect_id = id as i8;
            s.state = NetconnState::Init;
            s.ty = Some(ty);
        });
        info!("netconn {} created", id);
        Ok(Netconn { id })
    }

    /// Connect to a remote endpoint.
    ///
    /// Two phases, both bounded: the module first accepts the command,
    /// then reports the outcome asynchronously. UDP sockets run the same
    /// exchange so the send precondition is uniform across types.
    pub async fn connect<RW: Read + Write>(
        &self,
        transport: &AtTransport<'_, RW>,
        conn: Netconn,
        addr: IpAddr,
        port: u16,
    ) -> Result<(), Error> {
        let id = conn.id as usize;
        if self.res.slot_state(id) != Some(NetconnState::Init) {
            error!("netconn {} connect refused outside INIT", conn.id);
            return Err(Error::InvalidArgument);
        }

        let _pool = self.res.lock.lock().await;
        let ty = match self.res.with_slot(id, |s| s.ty).flatten() {
            Some(ty) => ty,
            None => return Err(Error::InvalidArgument),
        };

        self.res.events[id].reset();

        let mut cmd = CmdBuf::new();
        self.cmds.connect_cmd(&mut cmd, conn.id, ty, &addr, port)?;
        transport
            .execute(&AtRequest::new(&cmd).timeout(self.config.connect_cmd_timeout))
            .await?;

        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                error!("netconn {} connect timed out", conn.id);
                return Err(Error::Timeout);
            }
            match transport.wait_event(&self.res.events[id], deadline - now).await? {
                ConnEvent::Connected => break,
                ConnEvent::ConnectFailed => {
                    error!("netconn {} connect refused by the network", conn.id);
                    return Err(Error::Protocol);
                }
                _ => debug!("unrelated event while connecting, ignored"),
            }
        }

        self.res.with_slot(id, |s| {
            s.state = NetconnState::Connect;
            s.remote_ip = Some(addr);
            s.remote_port = port;
        });
        info!("netconn {} connected", conn.id);
        Ok(())
    }

    /// Send `data`, chunked to the vendor limit.
    ///
    /// The whole sequence (size command, payload, completion event) holds
    /// one exchange per chunk loop, so no other command can interleave. A
    /// failing chunk aborts and reports the bytes already flushed.
    pub async fn send<RW: Read + Write>(
        &self,
        transport: &AtTransport<'_, RW>,
        conn: Netconn,
        data: &[u8],
    ) -> Result<usize, SendError> {
        let id = conn.id as usize;
        let mut sent = 0usize;

        if self.res.slot_state(id) != Some(NetconnState::Connect) {
            error!("netconn {} send refused outside CONNECT", conn.id);
            return Err(SendError {
                sent,
                source: Error::InvalidArgument,
            });
        }

        let _pool = self.res.lock.lock().await;
        let max = self.cmds.max_send().min(config::SEND_CHUNK_MAX);
        let mut ex = transport.begin_exchange().await;
        let _ticket = SendTicket::new(self.res, conn.id);

        while sent < data.len() {
            if self.res.slot_state(id) != Some(NetconnState::Connect) {
                error!("netconn {} closed during send", conn.id);
                return Err(SendError {
                    sent,
                    source: Error::InvalidArgument,
                });
            }

            let chunk = &data[sent..data.len().min(sent + max)];
            self.res.events[id].reset();

            let mut cmd = CmdBuf::new();
            self.cmds
                .send_cmd(&mut cmd, conn.id, chunk.len())
                .map_err(|e| SendError { sent, source: e })?;
            let req = AtRequest::new(&cmd)
                .timeout(self.config.send_cmd_timeout)
                .end_mark(self.cmds.send_prompt());
            ex.execute(&req)
                .await
                .map_err(|e| SendError { sent, source: e })?;

            match self.cmds.payload_encoding() {
                PayloadEncoding::Raw => {
                    ex.send_raw(chunk)
                        .await
                        .map_err(|e| SendError { sent, source: e })?;
                }
                PayloadEncoding::Hex => {
                    let mut enc: Vec<u8, { 2 * config::SEND_CHUNK_MAX }> = Vec::new();
                    hex::encode_into(chunk, &mut enc)
                        .map_err(|e| SendError { sent, source: e })?;
                    ex.send_raw(&enc)
                        .await
                        .map_err(|e| SendError { sent, source: e })?;
                }
            }

            let deadline = Instant::now() + self.config.send_ack_timeout;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    error!("netconn {} send completion timed out", conn.id);
                    return Err(SendError {
                        sent,
                        source: Error::Timeout,
                    });
                }
                match ex
                    .wait_event(&self.res.events[id], deadline - now)
                    .await
                    .map_err(|e| SendError { sent, source: e })?
                {
                    ConnEvent::SendOk => break,
                    ConnEvent::SendFailed => {
                        error!("netconn {} chunk rejected after {} bytes", conn.id, sent);
                        return Err(SendError {
                            sent,
                            source: Error::Protocol,
                        });
                    }
                    _ => debug!("unrelated event while sending, ignored"),
                }
            }

            sent += chunk.len();
        }

        debug!("netconn {} sent {} bytes", conn.id, sent);
        Ok(sent)
    }

    /// Wait for one inbound segment.
    pub async fn recv(&self, conn: Netconn, timeout: Duration) -> Result<RecvData, Error> {
        let id = conn.id as usize;
        if id >= N {
            return Err(Error::InvalidArgument);
        }
        if let Ok(data) = self.res.queues[id].try_receive() {
            return Ok(data);
        }
        if self.res.slot_state(id) != Some(NetconnState::Connect) {
            return Err(Error::InvalidArgument);
        }
        match with_timeout(timeout, self.res.queues[id].receive()).await {
            Ok(data) => Ok(data),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Close the connection and return its slot to the pool. A second
    /// close of the same handle is a no-op.
    pub async fn close<RW: Read + Write>(
        &self,
        transport: &AtTransport<'_, RW>,
        conn: Netconn,
    ) -> Result<(), Error> {
        let id = conn.id as usize;
        let _pool = self.res.lock.lock().await;

        match self.res.slot_state(id) {
            Some(NetconnState::Init) | Some(NetconnState::Connect) => {
                let mut cmd = CmdBuf::new();
                self.cmds.close_cmd(&mut cmd, conn.id)?;
                transport.execute(&AtRequest::new(&cmd)).await?;
            }
            Some(NetconnState::Null) => return Ok(()),
            None => return Err(Error::InvalidArgument),
        }

        self.res.teardown(id);
        info!("netconn {} destroyed", conn.id);
        Ok(())
    }

    /// Close every live connection. Used at module teardown.
    pub async fn close_all<RW: Read + Write>(&self, transport: &AtTransport<'_, RW>) {
        for id in 0..N as u8 {
            let conn = Netconn { id };
            if self.state(conn) != NetconnState::Null {
                if let Err(e) = self.close(transport, conn).await {
                    warn!("netconn {} close failed at teardown: {:?}", id, e);
                }
            }
        }
    }

    /// Resolve a host name through the module. A literal address short
    /// circuits without touching the link.
    pub async fn resolve<RW: Read + Write>(
        &self,
        transport: &AtTransport<'_, RW>,
        host: &str,
    ) -> Result<IpAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let _pool = self.res.lock.lock().await;
        self.res.dns.reset();

        let mut cmd = CmdBuf::new();
        self.cmds.resolve_cmd(&mut cmd, host)?;
        transport.execute(&AtRequest::new(&cmd)).await?;
        transport
            .wait_event(&self.res.dns, self.config.dns_timeout)
            .await
    }

    fn post(&self, id: u8, event: ConnEvent) {
        if (id as usize) < N {
            self.res.events[id as usize].signal(event);
        } else {
            warn!("event for connection {} outside the pool", id);
        }
    }

    /// Remote side closed the connection. Shares the local-close teardown
    /// but issues no command.
    fn remote_closed(&self, id: u8) {
        match self.res.slot_state(id as usize) {
            Some(NetconnState::Init) | Some(NetconnState::Connect) => {
                warn!("netconn {} closed by remote", id);
                self.res.teardown(id as usize);
            }
            _ => warn!("close event for unknown connection {}, ignored", id),
        }
    }

    /// Inbound data already drained off the wire by the transport.
    fn ingest(&self, id: u8, announced: usize, trailing: &[u8]) {
        let mut data = RecvData::new();
        match self.cmds.payload_encoding() {
            PayloadEncoding::Raw => {
                if data.extend_from_slice(trailing).is_err() {
                    error!("netconn {} segment of {} bytes over buffer, dropped", id, announced);
                    return;
                }
            }
            PayloadEncoding::Hex => {
                if hex::decode_into(trailing, &mut data).is_err() {
                    warn!("netconn {} segment not valid hex, dropped", id);
                    return;
                }
            }
        }

        if self.res.slot_state(id as usize) != Some(NetconnState::Connect) {
            warn!("data for unknown connection {}, {} bytes discarded", id, announced);
            return;
        }
        if self.res.queues[id as usize].try_send(data).is_err() {
            warn!("netconn {} inbound queue full, segment dropped", id);
        }
    }
}

impl<const N: usize> UrcHandler for NetconnSet<'_, N> {
    fn trailing_len(&self, token: u8, line: &[u8]) -> usize {
        if token != TOKEN_EVENT {
            return 0;
        }
        let Ok(line) = core::str::from_utf8(line) else {
            return 0;
        };
        match self.cmds.parse_recv(line) {
            Some((_, announced)) => match self.cmds.payload_encoding() {
                PayloadEncoding::Raw => announced,
                PayloadEncoding::Hex => announced * 2,
            },
            None => 0,
        }
    }

    fn handle(&self, token: u8, line: &[u8], trailing: &[u8]) {
        let Ok(line) = core::str::from_utf8(line) else {
            warn!("non-text unsolicited line dropped");
            return;
        };

        match token {
            TOKEN_OPEN => {
                if let Some((id, ok)) = self.cmds.parse_connect_result(line) {
                    self.post(id, if ok { ConnEvent::Connected } else { ConnEvent::ConnectFailed });
                }
            }
            TOKEN_SEND => {
                if let Some(ok) = self.cmds.parse_send_result(line) {
                    match self.res.current_send() {
                        Some(id) => {
                            self.post(id, if ok { ConnEvent::SendOk } else { ConnEvent::SendFailed })
                        }
                        None => warn!("send completion with no send in flight"),
                    }
                }
            }
            TOKEN_EVENT => {
                if let Some(id) = self.cmds.parse_closed(line) {
                    self.remote_closed(id);
                } else if let Some((id, announced)) = self.cmds.parse_recv(line) {
                    self.ingest(id, announced, trailing);
                } else if let Some(ip) = self.cmds.parse_dns(line) {
                    self.res.dns.signal(ip);
                } else {
                    debug!("unhandled module event");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::NetconnRule;
    use crate::config::TransportConfig;
    use crate::test_helper::MockSerial;
    use crate::vendor::Ec200;
    use core::fmt::Write as _;
    use embassy_futures::block_on;

    /// The EC200 vocabulary with test-sized knobs: no status-query
    /// verification and 1024 byte chunks.
    struct TestCmds;

    impl NetconnCmds for TestCmds {
        fn strategy(&self) -> AllocStrategy {
            AllocStrategy::CallerAssigned { verify: false }
        }

        fn create_cmd(&self, out: &mut CmdBuf, ty: NetconnType) -> Result<bool, Error> {
            Ec200.create_cmd(out, ty)
        }

        fn connect_cmd(
            &self,
            out: &mut CmdBuf,
            id: u8,
            ty: NetconnType,
            addr: &IpAddr,
            port: u16,
        ) -> Result<(), Error> {
            Ec200.connect_cmd(out, id, ty, addr, port)
        }

        fn send_cmd(&self, out: &mut CmdBuf, id: u8, len: usize) -> Result<(), Error> {
            Ec200.send_cmd(out, id, len)
        }

        fn max_send(&self) -> usize {
            1024
        }

        fn close_cmd(&self, out: &mut CmdBuf, id: u8) -> Result<(), Error> {
            Ec200.close_cmd(out, id)
        }

        fn resolve_cmd(&self, out: &mut CmdBuf, host: &str) -> Result<(), Error> {
            Ec200.resolve_cmd(out, host)
        }

        fn rules(&self) -> &'static [NetconnRule] {
            Ec200.rules()
        }

        fn parse_connect_result(&self, line: &str) -> Option<(u8, bool)> {
            Ec200.parse_connect_result(line)
        }

        fn parse_send_result(&self, line: &str) -> Option<bool> {
            Ec200.parse_send_result(line)
        }

        fn parse_closed(&self, line: &str) -> Option<u8> {
            Ec200.parse_closed(line)
        }

        fn parse_recv(&self, line: &str) -> Option<(u8, usize)> {
            Ec200.parse_recv(line)
        }

        fn parse_dns(&self, line: &str) -> Option<IpAddr> {
            Ec200.parse_dns(line)
        }
    }

    /// Module-assigned ids and hex payloads, NSOCR style.
    struct TestHexCmds;

    impl NetconnCmds for TestHexCmds {
        fn strategy(&self) -> AllocStrategy {
            AllocStrategy::ModuleAssigned
        }

        fn create_cmd(&self, out: &mut CmdBuf, _ty: NetconnType) -> Result<bool, Error> {
            write!(out, "AT+NSOCR=DGRAM,17,0,1").map_err(|_| Error::Exhausted)?;
            Ok(true)
        }

        fn parse_created(&self, resp: &crate::transport::response::AtResponse) -> Option<u8> {
            resp.line(0)?.trim().parse().ok()
        }

        fn connect_cmd(
            &self,
            out: &mut CmdBuf,
            id: u8,
            _ty: NetconnType,
            addr: &IpAddr,
            port: u16,
        ) -> Result<(), Error> {
            write!(out, "AT+NSOCO={},{},{}", id, addr, port).map_err(|_| Error::Exhausted)
        }

        fn send_cmd(&self, out: &mut CmdBuf, id: u8, len: usize) -> Result<(), Error> {
            write!(out, "AT+NSOSD={},{}", id, len).map_err(|_| Error::Exhausted)
        }

        fn payload_encoding(&self) -> PayloadEncoding {
            PayloadEncoding::Hex
        }

        fn close_cmd(&self, out: &mut CmdBuf, id: u8) -> Result<(), Error> {
            write!(out, "AT+NSOCL={}", id).map_err(|_| Error::Exhausted)
        }

        fn rules(&self) -> &'static [NetconnRule] {
            &[
                NetconnRule {
                    prefix: "+NSOCO:",
                    suffix: "\r\n",
                    kind: NetconnUrcKind::Open,
                },
                NetconnRule {
                    prefix: "+NSOSTR:",
                    suffix: "\r\n",
                    kind: NetconnUrcKind::SendResult,
                },
                NetconnRule {
                    prefix: "+NSONMI:",
                    suffix: "\r\n",
                    kind: NetconnUrcKind::Event,
                },
            ]
        }

        fn parse_connect_result(&self, line: &str) -> Option<(u8, bool)> {
            let rest = line.strip_prefix("+NSOCO:")?.trim();
            let (id, err) = rest.split_once(',')?;
            Some((id.trim().parse().ok()?, err.trim() == "0"))
        }

        fn parse_send_result(&self, line: &str) -> Option<bool> {
            let rest = line.strip_prefix("+NSOSTR:")?;
            Some(rest.trim() == "1")
        }

        fn parse_recv(&self, line: &str) -> Option<(u8, usize)> {
            let rest = line.strip_prefix("+NSONMI:")?;
            let (id, len) = rest.trim().split_once(',')?;
            Some((id.trim().parse().ok()?, len.trim().parse().ok()?))
        }
    }

    fn tr_cfg() -> TransportConfig {
        TransportConfig {
            cmd_timeout: Duration::from_millis(50),
            connect_retries: 5,
        }
    }

    fn nc_cfg() -> NetconnConfig {
        NetconnConfig {
            connect_cmd_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(100),
            send_cmd_timeout: Duration::from_millis(100),
            send_ack_timeout: Duration::from_millis(100),
            dns_timeout: Duration::from_millis(100),
        }
    }

    fn addr() -> IpAddr {
        "1.2.3.4".parse().unwrap()
    }

    #[test]
    fn lifecycle_follows_null_init_connect_null() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        let conn = block_on(set.create(&tr, NetconnType::Tcp)).unwrap();
        assert_eq!(conn.id(), 0);
        assert_eq!(set.state(conn), NetconnState::Init);
        assert_eq!(set.connect_id(conn), 0);

        // send is refused before CONNECT and performs no I/O
        let err = block_on(set.send(&tr, conn, b"hello")).unwrap_err();
        assert_eq!(err.sent, 0);
        assert_eq!(err.source, Error::InvalidArgument);
        assert!(mock.written().is_empty());

        mock.inject(b"\r\nOK\r\n+QIOPEN: 0,0\r\n");
        block_on(set.connect(&tr, conn, addr(), 9000)).unwrap();
        assert_eq!(set.state(conn), NetconnState::Connect);
        assert_eq!(set.peer(conn), Some((addr(), 9000)));

        mock.inject(b"\r\nOK\r\n");
        block_on(set.close(&tr, conn)).unwrap();
        assert_eq!(set.state(conn), NetconnState::Null);
        assert_eq!(set.connect_id(conn), -1);
        assert_eq!(set.peer(conn), None);

        // close is idempotent once the slot is back to NULL
        block_on(set.close(&tr, conn)).unwrap();
    }

    #[test]
    fn connect_is_refused_outside_init() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        let conn = Netconn { id: 0 };
        assert_eq!(
            block_on(set.connect(&tr, conn, addr(), 80)),
            Err(Error::InvalidArgument)
        );
        assert!(mock.written().is_empty());
    }

    #[test]
    fn pool_exhaustion_leaves_live_connections_untouched() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        let a = block_on(set.create(&tr, NetconnType::Tcp)).unwrap();
        let b = block_on(set.create(&tr, NetconnType::Udp)).unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));

        assert_eq!(
            block_on(set.create(&tr, NetconnType::Tcp)),
            Err(Error::Exhausted)
        );
        assert_eq!(set.state(a), NetconnState::Init);
        assert_eq!(set.state(b), NetconnState::Init);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn connect_failure_keeps_slot_in_init() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        let conn = block_on(set.create(&tr, NetconnType::Tcp)).unwrap();
        mock.inject(b"\r\nOK\r\n+QIOPEN: 0,565\r\n");
        assert_eq!(
            block_on(set.connect(&tr, conn, addr(), 9000)),
            Err(Error::Protocol)
        );
        assert_eq!(set.state(conn), NetconnState::Init);
    }

    #[test]
    fn send_chunks_in_order_and_reports_total() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        let conn = block_on(set.create(&tr, NetconnType::Tcp)).unwrap();
        mock.inject(b"\r\nOK\r\n+QIOPEN: 0,0\r\n");
        block_on(set.connect(&tr, conn, addr(), 9000)).unwrap();
        mock.take_written();

        let data = [0x55u8; 3000];
        for _ in 0..3 {
            mock.inject(b"\r\n>");
            mock.inject(b"\r\nSEND OK\r\n");
        }
        assert_eq!(block_on(set.send(&tr, conn, &data)), Ok(3000));

        let written = mock.take_written();
        let text = String::from_utf8_lossy(&written).into_owned();
        let first = text.find("AT+QISEND=0,1024").unwrap();
        let second = text[first + 1..].find("AT+QISEND=0,1024").unwrap() + first + 1;
        let last = text.find("AT+QISEND=0,952").unwrap();
        assert!(first < second && second < last);
        assert_eq!(written.iter().filter(|b| **b == 0x55).count(), 3000);
    }

    #[test]
    fn failed_chunk_reports_partial_count() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        let conn = block_on(set.create(&tr, NetconnType::Tcp)).unwrap();
        mock.inject(b"\r\nOK\r\n+QIOPEN: 0,0\r\n");
        block_on(set.connect(&tr, conn, addr(), 9000)).unwrap();

        let data = [0xAAu8; 2000];
        mock.inject(b"\r\n>");
        mock.inject(b"\r\nSEND OK\r\n");
        mock.inject(b"\r\n>");
        mock.inject(b"\r\nSEND FAIL\r\n");
        let err = block_on(set.send(&tr, conn, &data)).unwrap_err();
        assert_eq!(err.sent, 1024);
        assert_eq!(err.source, Error::Protocol);
    }

    #[test]
    fn stale_remote_close_is_a_no_op() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        mock.inject(b"+QIURC: \"closed\",1\r\n");
        block_on(tr.drain(Duration::from_millis(20))).unwrap();

        assert_eq!(set.len(), 0);
        assert_eq!(set.state(Netconn { id: 1 }), NetconnState::Null);
    }

    #[test]
    fn remote_close_tears_down_like_local_close() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        let conn = block_on(set.create(&tr, NetconnType::Tcp)).unwrap();
        mock.inject(b"\r\nOK\r\n+QIOPEN: 0,0\r\n");
        block_on(set.connect(&tr, conn, addr(), 9000)).unwrap();

        mock.inject(b"+QIURC: \"closed\",0\r\n");
        block_on(tr.drain(Duration::from_millis(20))).unwrap();
        assert_eq!(set.state(conn), NetconnState::Null);

        let err = block_on(set.send(&tr, conn, b"x")).unwrap_err();
        assert_eq!(err.source, Error::InvalidArgument);
    }

    #[test]
    fn announced_bytes_are_drained_even_for_unknown_connection() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        // no connection 1 exists; payload must still leave the stream so
        // the following command frames cleanly
        mock.inject(b"+QIURC: \"recv\",1,8\r\nABCDEFGH\r\n\r\nOK\r\n");
        let resp = block_on(tr.execute(&AtRequest::new("AT"))).unwrap();
        assert_eq!(resp.line(0), Some("OK"));
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn inbound_data_reaches_the_connection_queue() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        let conn = block_on(set.create(&tr, NetconnType::Tcp)).unwrap();
        mock.inject(b"\r\nOK\r\n+QIOPEN: 0,0\r\n");
        block_on(set.connect(&tr, conn, addr(), 9000)).unwrap();

        mock.inject(b"+QIURC: \"recv\",0,4\r\nWXYZ\r\n");
        block_on(tr.drain(Duration::from_millis(20))).unwrap();

        let data = block_on(set.recv(conn, Duration::from_millis(20))).unwrap();
        assert_eq!(&data[..], b"WXYZ");
    }

    #[test]
    fn resolve_short_circuits_literal_addresses() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        let ip = block_on(set.resolve(&tr, "9.9.9.9")).unwrap();
        assert_eq!(ip, "9.9.9.9".parse::<IpAddr>().unwrap());
        assert!(mock.written().is_empty());
    }

    #[test]
    fn resolve_waits_for_the_dns_event() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        mock.inject(b"\r\nOK\r\n+QIURC: \"dnsgip\",0,1,600\r\n+QIURC: \"dnsgip\",\"5.6.7.8\"\r\n");
        let ip = block_on(set.resolve(&tr, "example.com")).unwrap();
        assert_eq!(ip, "5.6.7.8".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn module_assigned_id_comes_from_the_create_response() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestHexCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        mock.inject(b"\r\n1\r\nOK\r\n");
        let conn = block_on(set.create(&tr, NetconnType::Udp)).unwrap();
        assert_eq!(conn.id(), 1);
        assert_eq!(set.state(conn), NetconnState::Init);
        assert_eq!(set.state(Netconn { id: 0 }), NetconnState::Null);
        assert!(String::from_utf8_lossy(&mock.written()).contains("AT+NSOCR=DGRAM,17,0,1"));
    }

    #[test]
    fn hex_payload_goes_out_as_text() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestHexCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        mock.inject(b"\r\n0\r\nOK\r\n");
        let conn = block_on(set.create(&tr, NetconnType::Udp)).unwrap();
        mock.inject(b"\r\nOK\r\n+NSOCO: 0,0\r\n");
        block_on(set.connect(&tr, conn, addr(), 5683)).unwrap();
        mock.take_written();

        mock.inject(b"\r\n>");
        mock.inject(b"\r\n+NSOSTR: 1\r\n");
        assert_eq!(block_on(set.send(&tr, conn, &[0xAB, 0xCD])), Ok(2));

        let text = String::from_utf8_lossy(&mock.take_written()).into_owned();
        assert!(text.contains("AT+NSOSD=0,2"));
        assert!(text.contains("ABCD"));
    }

    #[test]
    fn hex_inbound_data_is_decoded() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &TestHexCmds, nc_cfg());
        let tr = AtTransport::new(mock.clone(), tr_cfg());
        set.install(&tr).unwrap();

        mock.inject(b"\r\n0\r\nOK\r\n");
        let conn = block_on(set.create(&tr, NetconnType::Udp)).unwrap();
        mock.inject(b"\r\nOK\r\n+NSOCO: 0,0\r\n");
        block_on(set.connect(&tr, conn, addr(), 5683)).unwrap();

        // 3 data bytes announced, 6 wire bytes drained
        mock.inject(b"+NSONMI: 0,3\r\n010203\r\n");
        block_on(tr.drain(Duration::from_millis(20))).unwrap();

        let data = block_on(set.recv(conn, Duration::from_millis(20))).unwrap();
        assert_eq!(&data[..], &[1, 2, 3]);
    }
}
