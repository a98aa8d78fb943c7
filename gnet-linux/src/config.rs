//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use gnet_core::NodeConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/gnet/config.toml or /etc/gnet/config.toml.
/// Env overrides: GNET_LISTEN_PORT, GNET_MAX_CONNECTIONS, GNET_PEERS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the listener binds to (default 0.0.0.0).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    /// Gnutella listen port (default 6346).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Externally visible IP to advertise, when the listener address is not it.
    #[serde(default)]
    pub external_ip: Option<Ipv4Addr>,
    /// Bootstrap peers dialed at startup.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub node: NodeConfig,
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_listen_port() -> u16 {
    6346
}
fn default_tick_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            external_ip: None,
            peers: Vec::new(),
            tick_interval_ms: default_tick_interval_ms(),
            node: NodeConfig::default(),
        }
    }
}

impl Config {
    pub fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    /// Address advertised to peers, if we know one worth advertising.
    pub fn advertised(&self) -> Option<SocketAddr> {
        let ip = match (self.external_ip, self.listen_addr) {
            (Some(ip), _) => IpAddr::V4(ip),
            (None, IpAddr::V4(ip)) if !ip.is_unspecified() => IpAddr::V4(ip),
            _ => return None,
        };
        Some(SocketAddr::new(ip, self.listen_port))
    }
}

/// Load config: default, then config file (explicit path, or the first standard
/// location that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok())?;
    anyhow::ensure!(c.tick_interval_ms > 0, "tick_interval_ms must be positive");
    c.node
        .validate()
        .context("invalid [node] configuration")?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/gnet/config.toml"));
    }
    out.push(PathBuf::from("/etc/gnet/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(s) = var("GNET_LISTEN_PORT") {
        c.listen_port = s.parse().context("GNET_LISTEN_PORT")?;
    }
    if let Some(s) = var("GNET_MAX_CONNECTIONS") {
        c.node.max_connections = s.parse().context("GNET_MAX_CONNECTIONS")?;
    }
    if let Some(s) = var("GNET_PEERS") {
        c.peers = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse().with_context(|| format!("GNET_PEERS entry {:?}", p)))
            .collect::<anyhow::Result<_>>()?;
    }
    Ok(())
}
