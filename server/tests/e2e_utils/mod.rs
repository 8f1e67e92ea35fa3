#![allow(dead_code)]

//! Fixtures for driving a real `TunnelService` over loopback: a scripted
//! tunnel endpoint and a canned HTTP target.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};

use rtun_common::exchange;
use rtun_common::protocol::{self, Command};
use rtun_server::public;
use rtun_server::service::TunnelService;

pub const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
pub const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
pub const RESPONSE_CHUNKED: &[u8] =
    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";

/// A running rtun-server with both listeners on ephemeral loopback ports.
pub struct TestServer {
    pub service: Arc<TunnelService>,
    pub tunnel_addr: SocketAddr,
    pub public_addr: SocketAddr,
}

impl TestServer {
    pub async fn start() -> Self {
        let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_addr = tunnel.local_addr().unwrap();
        let public_addr = public_listener.local_addr().unwrap();
        let service = TunnelService::new();
        tokio::spawn(Arc::clone(&service).run(tunnel));
        tokio::spawn(public::run(public_listener, Arc::clone(&service)));
        Self {
            service,
            tunnel_addr,
            public_addr,
        }
    }

    /// Poll until the idle pool is exactly `size`, up to `within`.
    pub async fn wait_for_pool_within(&self, size: usize, within: Duration) {
        timeout(within, async {
            while self.service.pool_size() != size {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "pool never reached {size}, still at {}",
                self.service.pool_size()
            )
        });
    }

    pub async fn wait_for_pool(&self, size: usize) {
        self.wait_for_pool_within(size, Duration::from_secs(5)).await;
    }
}

/// An HTTP/1.x target that answers every connection with `response` and
/// then holds the socket open, so message ends are detected by framing
/// rather than EOF.
pub async fn spawn_target(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                let mut read = 0;
                loop {
                    let n = conn.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = conn.write_all(response).await;
                let _ = conn.read(&mut buf).await;
            });
        }
    });
    addr
}

/// A scripted tunnel endpoint: one control connection plus `n` data
/// connections whose listeners bridge transports to `target`. Dropping it
/// closes the control channel.
pub struct TestEndpoint {
    pub ctrl: TcpStream,
}

impl TestEndpoint {
    pub async fn connect(tunnel_addr: SocketAddr, target: SocketAddr, n: usize) -> Self {
        let mut ctrl = TcpStream::connect(tunnel_addr).await.unwrap();
        protocol::send(&mut ctrl, Command::ConnectCtrl).await.unwrap();
        // Let the service adopt the control channel (and purge) before any
        // data connection can be classified.
        sleep(Duration::from_millis(50)).await;
        for _ in 0..n {
            let mut conn = TcpStream::connect(tunnel_addr).await.unwrap();
            protocol::send(&mut conn, Command::Connect).await.unwrap();
            tokio::spawn(data_listener(conn, target));
        }
        Self { ctrl }
    }

    /// Ask the service for its pool size over the control channel.
    pub async fn count(&mut self) -> usize {
        protocol::send(&mut self.ctrl, Command::CountConn).await.unwrap();
        let reply = protocol::recv_timeout(&mut self.ctrl).await.unwrap();
        std::str::from_utf8(&reply).unwrap().trim().parse().unwrap()
    }
}

/// What a real endpoint listener does on a data connection: answer
/// heartbeats, serve transports against `target`, release with `RESET`.
pub async fn data_listener(mut conn: TcpStream, target: SocketAddr) {
    loop {
        let Ok(bytes) = protocol::recv(&mut conn).await else {
            return;
        };
        match Command::from_wire(&bytes) {
            Some(Command::TransportStart) => {
                if protocol::send(&mut conn, Command::Ok).await.is_err() {
                    return;
                }
                if let Ok(mut local) = TcpStream::connect(target).await {
                    let _ = exchange::exchange(&mut conn, &mut local).await;
                }
                // Let the service drain the response before the release
                // marker follows it on the same socket; otherwise a greedy
                // read can swallow both and the assertions get racy.
                sleep(Duration::from_millis(50)).await;
                if protocol::send(&mut conn, Command::Reset).await.is_err() {
                    return;
                }
            }
            Some(Command::ConnHeart) => {
                if protocol::send(&mut conn, Command::Ok).await.is_err() {
                    return;
                }
            }
            _ => return,
        }
    }
}
