//! Public-port glue: accept end users, check a data connection out, run
//! the exchanger, hand the connection back.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rtun_common::exchange;

use crate::service::TunnelService;

/// Accept loop on the public port. Runs until the listener fails.
pub async fn run(listener: TcpListener, service: Arc<TunnelService>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "public listener ready");
    loop {
        let (mut user, addr) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let request_id = Uuid::new_v4();
            let Some(mut conn) = service.get_conn().await else {
                warn!(%request_id, user = %addr, "no idle data connection, dropping user");
                return;
            };
            debug!(%request_id, user = %addr, peer = conn.peer(), "bridging");
            if let Err(err) = exchange::exchange(&mut user, conn.stream()).await {
                warn!(%request_id, user = %addr, error = %err, "exchange failed");
            }
            drop(user);
            service.release_conn(conn).await;
        });
    }
}
