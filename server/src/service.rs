//! The tunnel-port service: classifies endpoint sockets, keeps the idle
//! pool, heartbeats it, and checks connections in and out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use rtun_common::protocol::{self, Command, UNSUPPORTED_REPLY};

/// Interval between liveness probes of idle data connections.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

type Pooled = Arc<Mutex<TcpStream>>;

/// A data connection checked out of the pool.
///
/// Holds the pool entry's lock for its whole lifetime, so a heartbeat probe
/// that raced the check-out blocks on the mutex instead of writing a probe
/// into the user's byte stream. Dropping the handle closes the socket.
pub struct PooledConn {
    key: String,
    conn: Pooled,
    guard: OwnedMutexGuard<TcpStream>,
}

impl PooledConn {
    /// The checked-out socket.
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.guard
    }

    /// Remote address the connection is keyed by.
    pub fn peer(&self) -> &str {
        &self.key
    }
}

/// State shared by the tunnel-port accept loop, the control adapter, the
/// heartbeat workers, and the public listener glue.
pub struct TunnelService {
    service_id: Uuid,
    /// Idle data connections, keyed by remote-address string. Checked-out
    /// connections are not in here.
    pool: DashMap<String, Pooled>,
    /// Whether a control adapter currently owns a control socket.
    ctrl_active: AtomicBool,
}

impl TunnelService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            service_id: Uuid::new_v4(),
            pool: DashMap::new(),
            ctrl_active: AtomicBool::new(false),
        })
    }

    /// Current idle-pool size. This is what `COUNTCONN` reports.
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Accept loop on the tunnel port. Runs until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(
            service_id = %self.service_id,
            addr = %listener.local_addr()?,
            "tunnel service listening"
        );
        tokio::spawn(Arc::clone(&self).heartbeat_loop());
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!(peer = %addr, "tunnel port connection");
            let service = Arc::clone(&self);
            tokio::spawn(service.classify(stream));
        }
    }

    /// Read exactly one command from a fresh tunnel-port socket and route it.
    async fn classify(self: Arc<Self>, mut stream: TcpStream) {
        let cmd = match protocol::recv_timeout(&mut stream).await {
            Ok(bytes) => Command::from_wire(&bytes),
            Err(err) => {
                debug!(error = %err, "tunnel port socket vanished before a command");
                return;
            }
        };
        match cmd {
            Some(Command::ConnectCtrl) => self.adopt_control(stream),
            Some(Command::Connect) => self.register(stream),
            _ => {
                // Unknown first command: close the socket, keep serving.
                debug!("unrecognised first command on tunnel port, closing socket");
            }
        }
    }

    /// Adopt a socket as the singleton control channel, or drop it if one
    /// is already present. Adoption purges whatever pool the previous
    /// endpoint left behind.
    fn adopt_control(self: Arc<Self>, stream: TcpStream) {
        if self
            .ctrl_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("control connection already present, dropping newcomer");
            return;
        }
        info!("control connection adopted");
        self.purge();
        tokio::spawn(self.control_adapter(stream));
    }

    /// Register a socket as an idle data connection.
    fn register(&self, stream: TcpStream) {
        match stream.peer_addr() {
            Ok(addr) => {
                let key = addr.to_string();
                debug!(peer = %key, "data connection pooled");
                self.pool.insert(key, Arc::new(Mutex::new(stream)));
            }
            Err(err) => warn!(error = %err, "dropping data connection without a peer address"),
        }
    }

    /// Serve the control channel until it breaks, then purge the pool and
    /// free the singleton slot.
    async fn control_adapter(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            let bytes = match protocol::recv(&mut stream).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    info!(error = %err, "control channel lost");
                    break;
                }
            };
            let reply = match Command::from_wire(&bytes) {
                Some(Command::CountConn) => self.pool_size().to_string().into_bytes(),
                _ => UNSUPPORTED_REPLY.to_vec(),
            };
            if let Err(err) = stream.write_all(&reply).await {
                info!(error = %err, "control channel lost");
                break;
            }
        }
        self.purge();
        self.ctrl_active.store(false, Ordering::Release);
    }

    /// Probe every idle connection once per [`HEARTBEAT_INTERVAL`].
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            // Snapshot first: a DashMap shard guard must not be held
            // across an await, and workers remove entries themselves.
            let idle: Vec<(String, Pooled)> = self
                .pool
                .iter()
                .map(|e| (e.key().clone(), Arc::clone(e.value())))
                .collect();
            for (key, conn) in idle {
                let service = Arc::clone(&self);
                tokio::spawn(async move { service.probe(key, conn).await });
            }
        }
    }

    /// One heartbeat: `CONNHEART` out, `OK` back, or the connection goes.
    async fn probe(&self, key: String, conn: Pooled) {
        let mut guard = conn.lock().await;
        let healthy = match protocol::send(&mut *guard, Command::ConnHeart).await {
            Ok(()) => matches!(
                protocol::recv_timeout(&mut *guard).await,
                Ok(reply) if reply == Command::Ok.wire_bytes()
            ),
            Err(_) => false,
        };
        drop(guard);
        if healthy {
            debug!(peer = %key, "heartbeat ok");
        } else if self.pool.remove(&key).is_some() {
            info!(peer = %key, "idle connection failed heartbeat, removed");
        }
    }

    /// Check any idle connection out: remove it from the pool, announce
    /// `TRANSPORTSTART`, and hand it over once the endpoint replies.
    /// Connections that fail the announcement are dropped and the next one
    /// is tried; `None` when no idle connection answers.
    pub async fn get_conn(&self) -> Option<PooledConn> {
        let keys: Vec<String> = self.pool.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some((key, conn)) = self.pool.remove(&key) else {
                continue;
            };
            let mut guard = Arc::clone(&conn).lock_owned().await;
            if let Err(err) = protocol::send(&mut *guard, Command::TransportStart).await {
                debug!(peer = %key, error = %err, "transport start failed, trying next");
                continue;
            }
            match protocol::recv_timeout(&mut *guard).await {
                Ok(_) => {
                    debug!(peer = %key, "data connection checked out");
                    return Some(PooledConn { key, conn, guard });
                }
                Err(err) => {
                    debug!(peer = %key, error = %err, "no reply to transport start, trying next");
                }
            }
        }
        None
    }

    /// Take a connection back after a transport. The endpoint confirms with
    /// `RESET`; anything else means the socket is no longer trustworthy and
    /// it is dropped.
    pub async fn release_conn(&self, mut checked_out: PooledConn) {
        let reply = protocol::recv_timeout(checked_out.stream()).await;
        match reply {
            Ok(reply) if Command::from_wire(&reply) == Some(Command::Reset) => {
                let PooledConn { key, conn, guard } = checked_out;
                drop(guard);
                debug!(peer = %key, "data connection released back to pool");
                self.pool.insert(key, conn);
            }
            Ok(reply) => {
                debug!(
                    peer = checked_out.peer(),
                    reply = %String::from_utf8_lossy(&reply),
                    "unexpected release reply, dropping data connection"
                );
            }
            Err(err) => {
                debug!(peer = checked_out.peer(), error = %err, "data connection lost at release");
            }
        }
    }

    /// Drop every idle connection.
    fn purge(&self) {
        let drained = self.pool.len();
        self.pool.clear();
        if drained > 0 {
            info!(count = drained, "idle pool purged");
        }
    }
}
