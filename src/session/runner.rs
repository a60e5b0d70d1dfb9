//! Session worker: drains deferred unsolicited work off the queue and
//! runs the user callbacks, away from the transport's receive stack.

use heapless::Vec;

use crate::config;
use crate::hex;

use super::{
    Notify, NotifyKind, NotifyStatus, Request, RequestKind, SessionEvents as _, SessionResources,
    SessionWork,
};

pub struct SessionRunner<'a> {
    res: &'a SessionResources<'a>,
}

impl<'a> SessionRunner<'a> {
    pub(crate) fn new(res: &'a SessionResources<'a>) -> Self {
        Self { res }
    }

    /// Worker loop. Spawn wherever long-running tasks live; returns once
    /// the owning session is destroyed, after handling everything queued
    /// ahead of the shutdown.
    pub async fn run(&self) {
        while self.process_one().await {}
        info!("session worker exit");
    }

    /// Handle a single queued item. `false` once shutdown is seen.
    pub async fn process_one(&self) -> bool {
        match self.res.queue.receive().await {
            SessionWork::Shutdown => false,
            SessionWork::Notify(line) => {
                self.handle_notify(&line);
                true
            }
            SessionWork::Request(line) => {
                self.handle_request(&line);
                true
            }
            SessionWork::Receive(line) => {
                self.handle_receive(&line);
                true
            }
        }
    }

    fn handle_notify(&self, line: &[u8]) {
        let Some(events) = self.res.callbacks() else {
            warn!("notify with no callbacks registered");
            return;
        };
        match core::str::from_utf8(line).ok().and_then(parse_notify) {
            Some(notify) => events.on_notify(notify),
            None => error!("unparseable notify line dropped"),
        }
    }

    fn handle_request(&self, line: &[u8]) {
        let Some(events) = self.res.callbacks() else {
            warn!("request with no callbacks registered");
            return;
        };
        match core::str::from_utf8(line).ok().and_then(parse_request) {
            Some(request) => events.on_request(request),
            None => error!("unparseable request line dropped"),
        }
    }

    fn handle_receive(&self, line: &[u8]) {
        let Some(events) = self.res.callbacks() else {
            warn!("data with no callbacks registered");
            return;
        };
        let Some(payload) = core::str::from_utf8(line)
            .ok()
            .and_then(|t| t.strip_prefix("+CTM2MRECV:"))
        else {
            error!("unparseable data line dropped");
            return;
        };

        let mut data: Vec<u8, { config::SESSION_LINE_MAX / 2 }> = Vec::new();
        match hex::decode_into(payload.trim().as_bytes(), &mut data) {
            Ok(()) => events.on_receive(&data),
            Err(_) => error!("data line not valid hex, dropped"),
        }
    }
}

/// `+CTM2M: <operation>,<status>[,<msg id>]`
fn parse_notify(line: &str) -> Option<Notify> {
    let rest = line.strip_prefix("+CTM2M:")?.trim_start();
    let mut it = rest.split(',');
    let kind = match it.next()?.trim() {
        "reg" => NotifyKind::Register,
        "obsrv" => NotifyKind::Observe,
        "update" => NotifyKind::Update,
        "ping" => NotifyKind::Ping,
        "dereg" => NotifyKind::Deregister,
        "send" => NotifyKind::Send,
        "lwstatus" => NotifyKind::LinkStatus,
        _ => return None,
    };
    let status = NotifyStatus::from_code(it.next()?.trim().parse().ok()?)?;
    let msg_id = it.next().and_then(|v| v.trim().parse().ok());
    Some(Notify {
        kind,
        status,
        msg_id,
    })
}

/// `+CTM2MCMD: <msg id>,<type>,<token>,<uri>[,<observe>[,<format>,<data>]]`
fn parse_request(line: &str) -> Option<Request<'_>> {
    let rest = line.strip_prefix("+CTM2MCMD:")?.trim_start();
    let mut it = rest.splitn(7, ',');

    let msg_id: i32 = it.next()?.trim().parse().ok()?;
    if msg_id < 0 {
        return None;
    }
    let kind = RequestKind::from_code(it.next()?.trim().parse().ok()?)?;
    let token = it.next()?.trim();
    let uri = it.next()?.trim();
    if token.is_empty() || uri.is_empty() {
        return None;
    }
    let observe = it.next().and_then(|v| v.trim().parse().ok());
    let data_format = it.next().and_then(|v| v.trim().parse().ok());
    let data = it.next().map(|v| v.trim()).filter(|v| !v.is_empty());

    Some(Request {
        msg_id,
        kind,
        token,
        uri,
        observe,
        data_format,
        data,
    })
}
