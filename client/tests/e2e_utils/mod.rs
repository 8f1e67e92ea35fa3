#![allow(dead_code)]

//! Fixtures for driving the real connector against a scripted tunnel
//! service over loopback.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};

use rtun_common::protocol::{self, Command};

pub const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
pub const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

/// A scripted tunnel service: adopts the first connection as the control
/// channel, answers `COUNTCONN` with the number of data connections seen so
/// far, and parks registered data connections for the tests to drive.
pub struct FixtureService {
    pub addr: SocketAddr,
    pub data_conns: Arc<Mutex<Vec<TcpStream>>>,
}

impl FixtureService {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let data_conns = Arc::new(Mutex::new(Vec::new()));
        let conns = Arc::clone(&data_conns);
        tokio::spawn(async move {
            // First connection in is the control channel.
            let (mut ctrl, _) = listener.accept().await.unwrap();
            // The announcement gets no reply, so the connector's first count
            // poll may land in the same read.
            let first = protocol::recv(&mut ctrl).await.unwrap();
            let announce = Command::ConnectCtrl.wire_bytes();
            assert!(first.starts_with(announce), "expected control announcement");
            let mut pending = first[announce.len()..].to_vec();
            loop {
                let bytes = if pending.is_empty() {
                    match protocol::recv(&mut ctrl).await {
                        Ok(bytes) => bytes,
                        Err(_) => return,
                    }
                } else {
                    std::mem::take(&mut pending)
                };
                if Command::from_wire(&bytes) != Some(Command::CountConn) {
                    return;
                }
                // Register data connections announced since the last poll,
                // so the count reply never runs ahead of the accept queue.
                while let Ok(Ok((mut conn, _))) =
                    timeout(Duration::from_millis(50), listener.accept()).await
                {
                    let bytes = protocol::recv(&mut conn).await.unwrap();
                    assert_eq!(Command::from_wire(&bytes), Some(Command::Connect));
                    conns.lock().await.push(conn);
                }
                let count = conns.lock().await.len().to_string();
                if ctrl.write_all(count.as_bytes()).await.is_err() {
                    return;
                }
            }
        });
        Self { addr, data_conns }
    }

    pub async fn count(&self) -> usize {
        self.data_conns.lock().await.len()
    }

    pub async fn wait_for_count(&self, n: usize, within: Duration) {
        timeout(within, async {
            while self.count().await != n {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("endpoint never announced {n} data connections"));
    }

    pub async fn take_data_conn(&self) -> TcpStream {
        self.data_conns.lock().await.remove(0)
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
