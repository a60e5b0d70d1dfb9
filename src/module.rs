//! Module bring-up and capability dispatch.
//!
//! A [`Module`] owns exactly one transport and a capability table. Every
//! public operation resolves its feature group first and fails with
//! `Unsupported` before any I/O when the concrete variant never
//! registered it.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Duration;
use embedded_io_async::{Read, Write};
use heapless::String;
use no_std_net::IpAddr;

use crate::cmd::{
    CmdBuf, CommandSet, GeneralCmds as _, IfconfigCmds as _, NetServCmds as _, PingCmds,
    PingReply, Query,
};
use crate::config::{self, TransportConfig};
use crate::error::Error;
use crate::netconn::{Netconn, NetconnSet, NetconnType, RecvData, SendError};
use crate::transport::response::AtRequest;
use crate::transport::urc::{UrcHandler, UrcRule};
use crate::transport::AtTransport;

/// Value carried by an information query.
pub type InfoString = String<{ config::INFO_LEN_MAX }>;

/// Reply signal for the ping feature, caller owned like the netconn
/// resources.
pub struct PingResources {
    reply: Signal<CriticalSectionRawMutex, PingReply>,
}

impl PingResources {
    pub const fn new() -> Self {
        Self {
            reply: Signal::new(),
        }
    }
}

impl Default for PingResources {
    fn default() -> Self {
        Self::new()
    }
}

/// Ping feature runtime: command table plus reply correlation.
pub struct Pinger<'a> {
    res: &'a PingResources,
    cmds: &'a dyn PingCmds,
}

impl<'a> Pinger<'a> {
    pub fn new(res: &'a PingResources, cmds: &'a dyn PingCmds) -> Self {
        Self { res, cmds }
    }

    pub(crate) fn install<RW: Read + Write>(
        &'a self,
        transport: &AtTransport<'a, RW>,
    ) -> Result<(), Error> {
        let (prefix, suffix) = self.cmds.rule();
        transport.add_urc_rules(&[UrcRule {
            prefix,
            suffix,
            token: 0,
            handler: self,
        }])
    }

    pub(crate) async fn ping<RW: Read + Write>(
        &self,
        transport: &AtTransport<'_, RW>,
        host: &str,
        timeout_s: u32,
    ) -> Result<PingReply, Error> {
        self.res.reply.reset();
        let mut cmd = CmdBuf::new();
        self.cmds.ping_cmd(&mut cmd, host, timeout_s)?;
        transport.execute(&AtRequest::new(&cmd)).await?;
        transport
            .wait_event(&self.res.reply, Duration::from_secs(timeout_s as u64 + 1))
            .await
    }
}

impl UrcHandler for Pinger<'_> {
    fn handle(&self, _token: u8, line: &[u8], _trailing: &[u8]) {
        let Ok(line) = core::str::from_utf8(line) else {
            return;
        };
        if let Some(reply) = self.cmds.parse_reply(line) {
            self.res.reply.signal(reply);
        } else {
            debug!("ping line without a usable reply");
        }
    }
}

/// Feature runtimes wired into a module at bring-up. Each entry is the
/// capability; an absent entry reports `Unsupported`.
#[derive(Default, Clone, Copy)]
pub struct Capabilities<'a, const N: usize = 4> {
    pub netconn: Option<&'a NetconnSet<'a, N>>,
    pub ping: Option<&'a Pinger<'a>>,
}

pub struct Module<'a, RW, const N: usize = 4> {
    name: &'a str,
    transport: AtTransport<'a, RW>,
    cmds: &'a dyn CommandSet,
    caps: Capabilities<'a, N>,
}

impl<'a, RW: Read + Write, const N: usize> Module<'a, RW, N> {
    /// Bring the module up.
    ///
    /// Installs the unsolicited rules of every registered feature, probes
    /// the command channel within the retry budget, then runs the vendor
    /// attach script. Failure at any point surfaces before the module
    /// exists, so nothing stays half registered.
    pub async fn new(
        name: &'a str,
        dev: RW,
        cmds: &'a dyn CommandSet,
        caps: Capabilities<'a, N>,
        config: TransportConfig,
    ) -> Result<Module<'a, RW, N>, Error> {
        let transport = AtTransport::new(dev, config);

        if let Some(nc) = caps.netconn {
            nc.install(&transport)?;
        }
        if let Some(p) = caps.ping {
            p.install(&transport)?;
        }

        let retries = transport.config().connect_retries;
        transport.handshake(retries).await?;

        for step in cmds.bringup() {
            transport
                .execute(&AtRequest::new(step.cmd).timeout(step.timeout))
                .await?;
        }

        info!("module {} up", name);
        Ok(Module {
            name,
            transport,
            cmds,
            caps,
        })
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn transport(&self) -> &AtTransport<'a, RW> {
        &self.transport
    }

    pub fn command_set(&self) -> &'a dyn CommandSet {
        self.cmds
    }

    /// Close every live connection. Safe to call again on an already
    /// quiesced module.
    pub async fn shutdown(&self) {
        if let Some(nc) = self.caps.netconn {
            nc.close_all(&self.transport).await;
        }
        info!("module {} down", self.name);
    }

    /// Plain `AT` probe of the live channel.
    pub async fn at_test(&self) -> Result<(), Error> {
        self.transport.execute(&AtRequest::new("AT")).await.map(|_| ())
    }

    async fn query(&self, q: Query) -> Result<InfoString, Error> {
        let resp = self.transport.execute(&AtRequest::new(q.cmd)).await?;
        let value = if q.prefix.is_empty() {
            resp.line(0).ok_or(Error::Protocol)?
        } else {
            resp.field_after(q.prefix).ok_or(Error::Protocol)?
        };
        let mut out = InfoString::new();
        out.push_str(value.trim()).map_err(|_| Error::Exhausted)?;
        Ok(out)
    }

    pub async fn get_imei(&self) -> Result<InfoString, Error> {
        let g = self.cmds.general().ok_or(Error::Unsupported)?;
        self.query(g.imei()).await
    }

    pub async fn get_imsi(&self) -> Result<InfoString, Error> {
        let g = self.cmds.general().ok_or(Error::Unsupported)?;
        self.query(g.imsi()).await
    }

    pub async fn get_iccid(&self) -> Result<InfoString, Error> {
        let g = self.cmds.general().ok_or(Error::Unsupported)?;
        self.query(g.iccid()).await
    }

    pub async fn get_firmware_version(&self) -> Result<InfoString, Error> {
        let g = self.cmds.general().ok_or(Error::Unsupported)?;
        self.query(g.firmware()).await
    }

    /// Signal quality as `(rssi, ber)` in the 3GPP encoding.
    pub async fn get_csq(&self) -> Result<(u8, u8), Error> {
        let ns = self.cmds.net_service().ok_or(Error::Unsupported)?;
        let value = self.query(ns.csq()).await?;
        let (rssi, ber) = two_ints(&value).ok_or(Error::Protocol)?;
        Ok((to_u8(rssi)?, to_u8(ber)?))
    }

    pub async fn get_attach_state(&self) -> Result<bool, Error> {
        let ns = self.cmds.net_service().ok_or(Error::Unsupported)?;
        let value = self.query(ns.attach()).await?;
        match value.trim().parse::<i32>() {
            Ok(0) => Ok(false),
            Ok(1) => Ok(true),
            _ => Err(Error::Protocol),
        }
    }

    /// Registration state as `(n, stat)`.
    pub async fn get_reg_state(&self) -> Result<(u8, u8), Error> {
        let ns = self.cmds.net_service().ok_or(Error::Unsupported)?;
        let value = self.query(ns.registration()).await?;
        let (n, stat) = two_ints(&value).ok_or(Error::Protocol)?;
        Ok((to_u8(n)?, to_u8(stat)?))
    }

    /// Address currently assigned to the module's data context.
    pub async fn get_ipaddr(&self) -> Result<IpAddr, Error> {
        let ifc = self.cmds.ifconfig().ok_or(Error::Unsupported)?;
        let q = ifc.ipaddr();
        let resp = self.transport.execute(&AtRequest::new(q.cmd)).await?;
        let line = resp.line_starting_with(q.prefix).ok_or(Error::Protocol)?;
        ifc.parse_ipaddr(line).ok_or(Error::Protocol)
    }

    pub async fn ping(&self, host: &str, timeout_s: u32) -> Result<PingReply, Error> {
        let p = self.caps.ping.ok_or(Error::Unsupported)?;
        p.ping(&self.transport, host, timeout_s).await
    }

    fn netconn(&self) -> Result<&'a NetconnSet<'a, N>, Error> {
        self.caps.netconn.ok_or(Error::Unsupported)
    }

    pub async fn netconn_create(&self, ty: NetconnType) -> Result<Netconn, Error> {
        self.netconn()?.create(&self.transport, ty).await
    }

    pub async fn netconn_connect(
        &self,
        conn: Netconn,
        addr: IpAddr,
        port: u16,
    ) -> Result<(), Error> {
        self.netconn()?.connect(&self.transport, conn, addr, port).await
    }

    pub async fn netconn_send(&self, conn: Netconn, data: &[u8]) -> Result<usize, SendError> {
        let nc = self.netconn().map_err(|e| SendError { sent: 0, source: e })?;
        nc.send(&self.transport, conn, data).await
    }

    pub async fn netconn_recv(&self, conn: Netconn, timeout: Duration) -> Result<RecvData, Error> {
        self.netconn()?.recv(conn, timeout).await
    }

    pub async fn netconn_close(&self, conn: Netconn) -> Result<(), Error> {
        self.netconn()?.close(&self.transport, conn).await
    }

    pub async fn netconn_resolve(&self, host: &str) -> Result<IpAddr, Error> {
        self.netconn()?.resolve(&self.transport, host).await
    }
}

fn two_ints(s: &str) -> Option<(i32, i32)> {
    let (a, b) = s.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn to_u8(v: i32) -> Result<u8, Error> {
    u8::try_from(v).map_err(|_| Error::Protocol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetconnConfig;
    use crate::netconn::NetconnResources;
    use crate::test_helper::MockSerial;
    use crate::vendor::{Ec200, Mb26};
    use embassy_futures::block_on;

    struct Bare;
    impl CommandSet for Bare {}

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

    #[test]
    fn unregistered_capabilities_fail_before_io() {
        let mock = MockSerial::new();
        mock.inject(b"\r\nOK\r\n");
        let module = block_on(Module::<_, 4>::new(
            "bare",
            mock.clone(),
            &Bare,
            Capabilities::default(),
            tr_cfg(),
        ))
        .unwrap();
        mock.take_written();

        assert_eq!(block_on(module.get_imei()).unwrap_err(), Error::Unsupported);
        assert_eq!(block_on(module.get_csq()).unwrap_err(), Error::Unsupported);
        assert_eq!(
            block_on(module.netconn_create(NetconnType::Tcp)).unwrap_err(),
            Error::Unsupported
        );
        assert_eq!(
            block_on(module.ping("1.1.1.1", 1)).unwrap_err(),
            Error::Unsupported
        );
        assert!(mock.written().is_empty());
    }

    #[test]
    fn bring_up_fails_after_retry_budget() {
        let mock = MockSerial::new();
        let err = block_on(Module::<_, 4>::new(
            "silent",
            mock.clone(),
            &Bare,
            Capabilities::default(),
            tr_cfg(),
        ))
        .unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert_eq!(mock.written(), b"AT\r\nAT\r\nAT\r\nAT\r\nAT\r\n");
    }

    #[test]
    fn bring_up_runs_the_vendor_attach_script() {
        let mock = MockSerial::new();
        mock.inject(b"\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n");
        block_on(Module::<_, 4>::new(
            "ec200",
            mock.clone(),
            &Ec200,
            Capabilities::default(),
            tr_cfg(),
        ))
        .unwrap();

        let text = std::string::String::from_utf8(mock.take_written()).unwrap();
        assert_eq!(
            text,
            "AT\r\nAT+QICSGP=1,1,\"CMNET\",\"\",\"\",0\r\nAT+QIDEACT=1\r\nAT+QIACT=1\r\n"
        );
    }

    #[test]
    fn info_and_net_service_queries_parse() {
        let mock = MockSerial::new();
        mock.inject(b"\r\nOK\r\n");
        let module = block_on(Module::<_, 4>::new(
            "mb26",
            mock.clone(),
            &Mb26,
            Capabilities::default(),
            tr_cfg(),
        ))
        .unwrap();

        mock.inject(b"\r\n+CGSN: 861234567890123\r\nOK\r\n");
        assert_eq!(
            block_on(module.get_imei()).unwrap().as_str(),
            "861234567890123"
        );

        mock.inject(b"\r\n+CSQ: 24,99\r\nOK\r\n");
        assert_eq!(block_on(module.get_csq()).unwrap(), (24, 99));

        mock.inject(b"\r\n+CGATT: 1\r\nOK\r\n");
        assert!(block_on(module.get_attach_state()).unwrap());

        mock.inject(b"\r\n+CEREG: 0,1\r\nOK\r\n");
        assert_eq!(block_on(module.get_reg_state()).unwrap(), (0, 1));
    }

    #[test]
    fn ec200_local_address_parses() {
        let mock = MockSerial::new();
        mock.inject(b"\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n");
        let module = block_on(Module::<_, 4>::new(
            "ec200",
            mock.clone(),
            &Ec200,
            Capabilities::default(),
            tr_cfg(),
        ))
        .unwrap();

        mock.inject(b"\r\n+CGPADDR: 1,\"10.64.2.7\"\r\nOK\r\n");
        assert_eq!(
            block_on(module.get_ipaddr()).unwrap(),
            "10.64.2.7".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn ec200_ping_reply_arrives_as_urc() {
        let mock = MockSerial::new();
        let ping_res = PingResources::new();
        let pinger = Pinger::new(&ping_res, &Ec200);
        mock.inject(b"\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n");
        let module = block_on(Module::<_, 4>::new(
            "ec200",
            mock.clone(),
            &Ec200,
            Capabilities {
                netconn: None,
                ping: Some(&pinger),
            },
            tr_cfg(),
        ))
        .unwrap();

        mock.inject(b"\r\nOK\r\n+QPING: 0,\"1.2.3.4\",32,78,64\r\n");
        let reply = block_on(module.ping("1.2.3.4", 1)).unwrap();
        assert_eq!(reply, PingReply { time_ms: 78, ttl: 64 });
    }

    #[test]
    fn ec200_create_verifies_ids_against_module_state() {
        let mock = MockSerial::new();
        let res = NetconnResources::<2>::new();
        let set = NetconnSet::new(&res, &Ec200, nc_cfg());
        mock.inject(b"\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n");
        let module = block_on(Module::new(
            "ec200",
            mock.clone(),
            &Ec200,
            Capabilities {
                netconn: Some(&set),
                ping: None,
            },
            tr_cfg(),
        ))
        .unwrap();
        mock.take_written();

        // id 0 is still busy on the module, id 1 is free
        mock.inject(b"\r\n+QISTATE: 0,\"TCP\",\"1.1.1.1\",80,0,2,1,0,0,\"uart1\"\r\nOK\r\n");
        mock.inject(b"\r\nOK\r\n");
        let conn = block_on(module.netconn_create(NetconnType::Tcp)).unwrap();
        assert_eq!(conn.id(), 1);

        let text = std::string::String::from_utf8(mock.take_written()).unwrap();
        assert!(text.contains("AT+QISTATE=1,0"));
        assert!(text.contains("AT+QISTATE=1,1"));
    }
}
