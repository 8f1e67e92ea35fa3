//! rtun: expose a local service through an rtun-server.
//!
//! Usage:
//!   rtun --server tunnel.example.com:8101 --proxy 127.0.0.1:8000

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time::sleep;
use tracing::{error, info, warn};

use rtun::connector::{Connector, LocalForward, DEFAULT_MAX_IDLE};

/// Pause between reconnect attempts after the control channel breaks.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "rtun", about = "Expose a NATed local service through an rtun tunnel")]
struct Cli {
    /// Tunnel service address to dial out to.
    #[arg(long, default_value = "127.0.0.1:8101", env = "RTUN_SERVER")]
    server: String,

    /// Local service that user traffic is bridged to.
    #[arg(long, default_value = "192.168.2.8:80", env = "RTUN_PROXY")]
    proxy: String,

    /// Idle connections to keep pre-established on the service.
    #[arg(long, default_value_t = DEFAULT_MAX_IDLE, env = "RTUN_POOL_SIZE")]
    pool_size: usize,

    /// Automatically reconnect when the control channel breaks.
    #[arg(long, default_value_t = true)]
    reconnect: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    info!(
        server = %cli.server,
        proxy = %cli.proxy,
        pool_size = cli.pool_size,
        "starting rtun endpoint"
    );

    let transport = Arc::new(LocalForward::new(cli.proxy.clone()));
    let connector = Connector::new(cli.server.clone(), cli.pool_size, transport);

    loop {
        match connector.run().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                error!(error = %err, "tunnel connection failed");
                if !cli.reconnect {
                    return Err(err);
                }
                warn!("reconnecting in 1 second");
                sleep(RECONNECT_INTERVAL).await;
            }
        }
    }
}
