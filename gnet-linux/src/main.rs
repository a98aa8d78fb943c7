// gnet: Gnutella servent daemon (listener, outbound dialer, single-threaded reactor).

mod config;
mod net;
mod reactor;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use gnet_core::{GuidRoutes, HostCache, ServentCore};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::reactor::Reactor;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "gnet", version, about = "Gnutella servent daemon")]
struct Args {
    /// Config file (default: ~/.config/gnet/config.toml, then /etc/gnet/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bootstrap peer, repeatable
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Externally visible IPv4 address to advertise
    #[arg(long)]
    external_ip: Option<Ipv4Addr>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        cfg.listen_port = port;
    }
    if args.external_ip.is_some() {
        cfg.external_ip = args.external_ip;
    }
    cfg.peers.extend(args.peers);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let listen = cfg.listen();
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    let mut core = ServentCore::new(
        cfg.node.clone(),
        Box::new(HostCache::default()),
        Box::new(GuidRoutes::default()),
    )?;
    if let Some(addr) = cfg.advertised() {
        core.set_local_addr(addr);
    }
    info!(
        version = VERSION,
        listen = %listen,
        advertised = ?cfg.advertised(),
        max_connections = cfg.node.max_connections,
        "gnet servent started"
    );

    let mut reactor = Reactor::new(core, cfg.node.connect_timeout());
    reactor.bootstrap(&cfg.peers);
    reactor
        .run(
            listener,
            Duration::from_millis(cfg.tick_interval_ms),
            shutdown_signal(),
        )
        .await
}

/// Wait for Ctrl+C or SIGTERM (Unix). Connections are closed cleanly before exit.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
