//! rtun-server: accepts tunnel endpoints on one port, end users on another.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use rtun_server::{public, service::TunnelService};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "rtun-server", about = "Public half of the rtun reverse tunnel")]
struct Cli {
    /// Address end users connect to.
    #[arg(long, default_value = "0.0.0.0:8080", env = "RTUN_LISTEN")]
    listen: String,

    /// Address tunnel endpoints dial out to.
    #[arg(long, alias = "tunel", default_value = "0.0.0.0:8101", env = "RTUN_TUNNEL")]
    tunnel: String,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let tunnel = TcpListener::bind(&cli.tunnel)
        .await
        .with_context(|| format!("cannot listen on tunnel address {}", cli.tunnel))?;
    let public_listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("cannot listen on public address {}", cli.listen))?;

    let service = TunnelService::new();

    // Either loop failing is fatal; the process runs until killed otherwise.
    tokio::select! {
        res = Arc::clone(&service).run(tunnel) => res,
        res = public::run(public_listener, service) => res,
    }
}
