//! Endpoint connector: maintains the control connection, keeps the idle
//! pool on the service at its target size, and serves transports on data
//! connections.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rtun_common::exchange;
use rtun_common::protocol::{self, Command};

/// How long the size loop idles when the pool is already at target.
const SIZE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of idle connections kept pre-established.
pub const DEFAULT_MAX_IDLE: usize = 50;

/// What happens on a data connection once the service announces a
/// transport: the implementation owns the socket for exactly one bridged
/// request/response cycle.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn run(&self, tunnel: &mut TcpStream) -> Result<()>;
}

/// The shipped [`Transport`]: dial a fixed local target and bridge one
/// exchange between it and the tunnel.
pub struct LocalForward {
    target: String,
}

impl LocalForward {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait]
impl Transport for LocalForward {
    async fn run(&self, tunnel: &mut TcpStream) -> Result<()> {
        let mut local = TcpStream::connect(&self.target)
            .await
            .with_context(|| format!("cannot connect to local target {}", self.target))?;
        exchange::exchange(tunnel, &mut local).await?;
        Ok(())
    }
}

/// Dial-out side of the tunnel. One `run` call owns one control channel;
/// when it breaks the caller decides whether to reconnect.
pub struct Connector {
    server: String,
    max_idle: usize,
    connector_id: Uuid,
    transport: Arc<dyn Transport>,
}

impl Connector {
    pub fn new(server: impl Into<String>, max_idle: usize, transport: Arc<dyn Transport>) -> Self {
        Self {
            server: server.into(),
            max_idle,
            connector_id: Uuid::new_v4(),
            transport,
        }
    }

    /// Become the service's control channel and keep its idle pool at
    /// `max_idle` until the channel breaks.
    pub async fn run(&self) -> Result<()> {
        let mut ctrl = TcpStream::connect(&self.server)
            .await
            .with_context(|| format!("cannot reach tunnel service at {}", self.server))?;
        protocol::send(&mut ctrl, Command::ConnectCtrl).await?;
        info!(
            connector_id = %self.connector_id,
            server = %self.server,
            "control channel established"
        );

        loop {
            protocol::send(&mut ctrl, Command::CountConn).await?;
            let reply = protocol::recv_timeout(&mut ctrl).await?;
            let count: usize = std::str::from_utf8(&reply)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .with_context(|| {
                    format!("unparseable pool count {:?}", String::from_utf8_lossy(&reply))
                })?;
            if count < self.max_idle {
                self.add_connection().await?;
            } else {
                sleep(SIZE_POLL_INTERVAL).await;
            }
        }
    }

    /// Dial a fresh data connection, announce it, and leave a listener task
    /// serving it. The connection is not tracked locally: the service owns
    /// its lifecycle from here.
    async fn add_connection(&self) -> Result<()> {
        let mut conn = TcpStream::connect(&self.server).await?;
        protocol::send(&mut conn, Command::Connect).await?;
        debug!(connector_id = %self.connector_id, "data connection announced");
        tokio::spawn(listen(conn, Arc::clone(&self.transport)));
        Ok(())
    }
}

/// Serve one data connection: read a command, act, read the next. Exits by
/// closing the socket; the service's heartbeat will notice.
async fn listen(mut conn: TcpStream, transport: Arc<dyn Transport>) {
    loop {
        let bytes = match protocol::recv(&mut conn).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(error = %err, "data connection closed");
                return;
            }
        };
        match Command::from_wire(&bytes) {
            Some(Command::TransportStart) => {
                if protocol::send(&mut conn, Command::Ok).await.is_err() {
                    return;
                }
                if let Err(err) = transport.run(&mut conn).await {
                    warn!(error = %err, "transport failed");
                }
                // Release: the same socket goes back to being idle. If the
                // service cannot hear it, the socket is no good anymore.
                if protocol::send(&mut conn, Command::Reset).await.is_err() {
                    return;
                }
            }
            Some(Command::ConnHeart) => {
                if protocol::send(&mut conn, Command::Ok).await.is_err() {
                    return;
                }
            }
            _ => {
                debug!("unrecognised command on data connection, closing");
                return;
            }
        }
    }
}
