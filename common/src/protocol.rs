//! Control-plane command tokens and their wire framing.
//!
//! Every command is a fixed ASCII byte sequence bracketed by `\r` and `\n`.
//! Each side sends one command at a time and waits for the reply, so a
//! command is always read whole with a single `read()` into a
//! [`CMD_MAX_LEN`]-byte buffer; there is no partial-command reassembly.
//! Replies that are not tokens (the decimal pool count, the `401` string)
//! are returned to callers as raw bytes.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::ProtocolError;

/// Largest single command read.
pub const CMD_MAX_LEN: usize = 1024;

/// Upper bound on writing one command to the wire.
pub const CMD_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on waiting for one command or reply.
pub const CMD_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Reply sent on the control channel for a command the service does not know.
pub const UNSUPPORTED_REPLY: &[u8] = b"401: cmd not support!";

// ── Tokens ────────────────────────────────────────────────────────────────────

const CONNECT_CTRL: &[u8] = b"\r- doconnectctrl -\n";
const CONNECT: &[u8] = b"\r- doconnect -\n";
const COUNT_CONN: &[u8] = b"\r- countconn -\n";
const CLEAR_CONN: &[u8] = b"\r- clearconn -\n";
const TRANSPORT_START: &[u8] = b"\r- transportstart -\n";
const CONN_HEART: &[u8] = b"\r- connheart -\n";
const OK: &[u8] = b"\r- ok -\n";
const RESET: &[u8] = b"\r- reset -\n";

/// The closed set of control-plane commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Adopt this socket as the singleton control channel.
    ConnectCtrl,
    /// Register this socket as an idle data connection.
    Connect,
    /// Ask for the current idle-pool size (reply: decimal ASCII).
    CountConn,
    /// Drop every idle data connection.
    ClearConn,
    /// Hand this data connection to a user request.
    TransportStart,
    /// Liveness probe for an idle data connection.
    ConnHeart,
    /// Positive acknowledgement.
    Ok,
    /// The endpoint is done with a transport; the socket is idle again.
    Reset,
}

impl Command {
    /// Exact byte sequence sent on the wire for this command.
    pub const fn wire_bytes(self) -> &'static [u8] {
        match self {
            Command::ConnectCtrl => CONNECT_CTRL,
            Command::Connect => CONNECT,
            Command::CountConn => COUNT_CONN,
            Command::ClearConn => CLEAR_CONN,
            Command::TransportStart => TRANSPORT_START,
            Command::ConnHeart => CONN_HEART,
            Command::Ok => OK,
            Command::Reset => RESET,
        }
    }

    /// Parse a received buffer; `None` for anything outside the closed set.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        match bytes {
            CONNECT_CTRL => Some(Command::ConnectCtrl),
            CONNECT => Some(Command::Connect),
            COUNT_CONN => Some(Command::CountConn),
            CLEAR_CONN => Some(Command::ClearConn),
            TRANSPORT_START => Some(Command::TransportStart),
            CONN_HEART => Some(Command::ConnHeart),
            OK => Some(Command::Ok),
            RESET => Some(Command::Reset),
            _ => None,
        }
    }
}

// ── Wire helpers ──────────────────────────────────────────────────────────────

/// Write one command, bounded by [`CMD_WRITE_TIMEOUT`].
pub async fn send<S>(stream: &mut S, cmd: Command) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    match timeout(CMD_WRITE_TIMEOUT, stream.write_all(cmd.wire_bytes())).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Read one command or reply: a single `read()` of up to [`CMD_MAX_LEN`]
/// bytes. A zero-length read means the peer closed the connection.
pub async fn recv<S>(stream: &mut S) -> Result<Vec<u8>, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; CMD_MAX_LEN];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(ProtocolError::Closed);
    }
    Ok(buf[..n].to_vec())
}

/// [`recv`] bounded by [`CMD_READ_TIMEOUT`]. Used on the control plane
/// wherever an unbounded wait could wedge a worker on a half-open peer.
pub async fn recv_timeout<S>(stream: &mut S) -> Result<Vec<u8>, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    match timeout(CMD_READ_TIMEOUT, recv(stream)).await {
        Ok(res) => res,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
