//! Buffer capacities and protocol timing defaults.
//!
//! The deadlines mirror what the supported modules actually need: network
//! attach and TCP opens are confirmed tens of seconds after the command is
//! accepted, while plain queries answer within a few seconds.

use embassy_time::Duration;

/// Wire bytes buffered ahead of line assembly.
pub const RECV_BUF_LEN: usize = 512;
/// Longest single response or unsolicited line.
pub const LINE_LEN_MAX: usize = 256;
/// Flat storage for all lines of one response.
pub const RESP_BUF_LEN: usize = 512;
/// Lines one response may carry.
pub const RESP_LINE_MAX: usize = 8;
/// Rows in the unsolicited-code match table.
pub const URC_RULE_MAX: usize = 16;
/// Largest payload a data-announcing unsolicited line may carry on the
/// wire (hex encoded payloads take two wire bytes per data byte).
pub const URC_PAYLOAD_MAX: usize = 2048;
/// Formatted command line limit.
pub const CMD_LEN_MAX: usize = 192;
/// Longest value returned by an information query.
pub const INFO_LEN_MAX: usize = 64;

/// Inbound queue depth per virtual connection.
pub const NETCONN_RX_QUEUE: usize = 8;
/// Largest single inbound segment stored per queue item.
pub const NETCONN_RX_MSG_MAX: usize = 1024;
/// Upper bound on one send chunk, independent of the vendor limit.
pub const SEND_CHUNK_MAX: usize = 1460;

/// Deferred work items a session buffers before dropping new ones.
pub const SESSION_QUEUE_DEPTH: usize = 6;
/// Longest unsolicited line a session copies off the receive path.
pub const SESSION_LINE_MAX: usize = 256;
/// Largest application payload one session send accepts.
pub const SESSION_SEND_MAX: usize = 1024;

pub(crate) const CMD_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);

/// Link-level behavior, owned by the transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline for a command whose request does not set its own.
    pub cmd_timeout: Duration,
    /// Probe attempts during bring-up before the module counts as absent.
    pub connect_retries: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            cmd_timeout: CMD_TIMEOUT_DEFAULT,
            connect_retries: 5,
        }
    }
}

/// Deadlines for virtual-connection operations.
#[derive(Debug, Clone)]
pub struct NetconnConfig {
    /// Acceptance of the connect command itself.
    pub connect_cmd_timeout: Duration,
    /// Arrival of the connect outcome event after acceptance.
    pub connect_timeout: Duration,
    /// Acceptance of one send chunk up to the payload prompt.
    pub send_cmd_timeout: Duration,
    /// Completion event for one flushed chunk.
    pub send_ack_timeout: Duration,
    /// Name resolution reply.
    pub dns_timeout: Duration,
}

impl Default for NetconnConfig {
    fn default() -> Self {
        Self {
            connect_cmd_timeout: Duration::from_secs(150),
            connect_timeout: Duration::from_secs(60),
            send_cmd_timeout: Duration::from_secs(5),
            send_ack_timeout: Duration::from_secs(10),
            dns_timeout: Duration::from_secs(60),
        }
    }
}

/// Deadlines for session-protocol exchanges.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cmd_timeout: Duration,
    /// Wait for the asynchronous "sent, here is your message id" event.
    pub ack_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cmd_timeout: Duration::from_secs(6),
            ack_timeout: Duration::from_secs(6),
        }
    }
}
