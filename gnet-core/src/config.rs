//! Tunables of the servent core. Every field has a serde default so partial TOML tables work.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::getline::MAX_LINE_SIZE;
use crate::header::{MAX_HEADER_LINES, MAX_HEADER_SIZE};
use crate::wire::SizeLimits;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Established (non-placeholder) connections we accept before answering busy.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Connections we try to keep; also the TTL=0 kick threshold.
    #[serde(default = "default_up_connections")]
    pub up_connections: usize,
    #[serde(default = "default_max_line_size")]
    pub max_line_size: usize,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_header_lines")]
    pub max_header_lines: usize,
    /// Largest query payload read before the sender is kicked.
    #[serde(default = "default_query_kick_size")]
    pub query_kick_size: u32,
    #[serde(default = "default_query_hit_kick_size")]
    pub query_hit_kick_size: u32,
    #[serde(default = "default_other_kick_size")]
    pub other_kick_size: u32,
    /// Largest query we relay or handle.
    #[serde(default = "default_query_forward_size")]
    pub query_forward_size: u32,
    #[serde(default = "default_query_hit_forward_size")]
    pub query_hit_forward_size: u32,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_queue_lowat")]
    pub queue_lowat: usize,
    #[serde(default = "default_queue_hiwat")]
    pub queue_hiwat: usize,
    /// Seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Pongs a busy placeholder connection sends before closing.
    #[serde(default = "default_connect_pongs")]
    pub connect_pongs: usize,
    #[serde(default)]
    pub reject_private: bool,
    /// At most one inbound connection per remote IP, whatever its port.
    #[serde(default = "default_true")]
    pub unique_inbound_per_host: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub hits: HitsConfig,
}

/// Query-hit admission thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HitsConfig {
    /// Seconds between table rotations.
    #[serde(default = "default_half_life")]
    pub half_life: u64,
    #[serde(default = "default_min_hits")]
    pub min_hits: u32,
    #[serde(default = "default_popular_hits")]
    pub popular_hits: u32,
    #[serde(default = "default_max_hits")]
    pub max_hits: u32,
}

fn default_max_connections() -> usize {
    8
}
fn default_up_connections() -> usize {
    4
}
fn default_max_line_size() -> usize {
    MAX_LINE_SIZE
}
fn default_max_header_size() -> usize {
    MAX_HEADER_SIZE
}
fn default_max_header_lines() -> usize {
    MAX_HEADER_LINES
}
fn default_query_kick_size() -> u32 {
    1024
}
fn default_query_hit_kick_size() -> u32 {
    64 * 1024
}
fn default_other_kick_size() -> u32 {
    40_000
}
fn default_query_forward_size() -> u32 {
    256
}
fn default_query_hit_forward_size() -> u32 {
    64 * 1024
}
fn default_queue_size() -> usize {
    96 * 1024
}
fn default_queue_lowat() -> usize {
    32 * 1024
}
fn default_queue_hiwat() -> usize {
    64 * 1024
}
fn default_connect_timeout() -> u64 {
    20
}
fn default_handshake_timeout() -> u64 {
    45
}
fn default_idle_timeout() -> u64 {
    180
}
fn default_connect_pongs() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_user_agent() -> String {
    format!("gnet/{}", env!("CARGO_PKG_VERSION"))
}
fn default_half_life() -> u64 {
    300
}
fn default_min_hits() -> u32 {
    250
}
fn default_popular_hits() -> u32 {
    500
}
fn default_max_hits() -> u32 {
    1000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            up_connections: default_up_connections(),
            max_line_size: default_max_line_size(),
            max_header_size: default_max_header_size(),
            max_header_lines: default_max_header_lines(),
            query_kick_size: default_query_kick_size(),
            query_hit_kick_size: default_query_hit_kick_size(),
            other_kick_size: default_other_kick_size(),
            query_forward_size: default_query_forward_size(),
            query_hit_forward_size: default_query_hit_forward_size(),
            queue_size: default_queue_size(),
            queue_lowat: default_queue_lowat(),
            queue_hiwat: default_queue_hiwat(),
            connect_timeout: default_connect_timeout(),
            handshake_timeout: default_handshake_timeout(),
            idle_timeout: default_idle_timeout(),
            connect_pongs: default_connect_pongs(),
            reject_private: false,
            unique_inbound_per_host: true,
            user_agent: default_user_agent(),
            hits: HitsConfig::default(),
        }
    }
}

impl Default for HitsConfig {
    fn default() -> Self {
        Self {
            half_life: default_half_life(),
            min_hits: default_min_hits(),
            popular_hits: default_popular_hits(),
            max_hits: default_max_hits(),
        }
    }
}

impl HitsConfig {
    pub fn half_life(&self) -> Duration {
        Duration::from_secs(self.half_life)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("queue_lowat ({lowat}) exceeds queue_hiwat ({hiwat})")]
    Watermarks { lowat: usize, hiwat: usize },
    #[error("queue_hiwat ({hiwat}) exceeds queue_size ({size})")]
    QueueSize { hiwat: usize, size: usize },
    #[error("hit thresholds must satisfy min_hits <= popular_hits <= max_hits")]
    HitThresholds,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("max_line_size", self.max_line_size),
            ("max_header_size", self.max_header_size),
            ("max_header_lines", self.max_header_lines),
            ("queue_size", self.queue_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.hits.half_life == 0 {
            return Err(ConfigError::Zero("hits.half_life"));
        }
        if self.queue_lowat > self.queue_hiwat {
            return Err(ConfigError::Watermarks {
                lowat: self.queue_lowat,
                hiwat: self.queue_hiwat,
            });
        }
        if self.queue_hiwat > self.queue_size {
            return Err(ConfigError::QueueSize {
                hiwat: self.queue_hiwat,
                size: self.queue_size,
            });
        }
        let h = &self.hits;
        if h.min_hits > h.popular_hits || h.popular_hits > h.max_hits {
            return Err(ConfigError::HitThresholds);
        }
        Ok(())
    }

    /// Payload ceilings enforced while reading.
    pub fn kick_limits(&self) -> SizeLimits {
        SizeLimits {
            query: self.query_kick_size,
            query_hit: self.query_hit_kick_size,
            other: self.other_kick_size,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = NodeConfig::default();
        assert_eq!(c.validate(), Ok(()));
        assert_eq!(c.queue_size, 98304);
        assert_eq!(c.kick_limits().max(), 65536);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let c: NodeConfig = toml::from_str(
            "max_connections = 3\n[hits]\nmin_hits = 10\n",
        )
        .unwrap();
        assert_eq!(c.max_connections, 3);
        assert_eq!(c.hits.min_hits, 10);
        assert_eq!(c.hits.popular_hits, 500);
        assert_eq!(c.idle_timeout(), Duration::from_secs(180));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<NodeConfig>("max_conections = 3\n").is_err());
    }

    #[test]
    fn inconsistent_settings() {
        let mut c = NodeConfig::default();
        c.queue_lowat = c.queue_hiwat + 1;
        assert!(matches!(c.validate(), Err(ConfigError::Watermarks { .. })));
        let mut c = NodeConfig::default();
        c.queue_size = 10;
        assert!(matches!(c.validate(), Err(ConfigError::QueueSize { .. })));
        let mut c = NodeConfig::default();
        c.hits.min_hits = 600;
        assert_eq!(c.validate(), Err(ConfigError::HitThresholds));
        let mut c = NodeConfig::default();
        c.max_line_size = 0;
        assert_eq!(c.validate(), Err(ConfigError::Zero("max_line_size")));
    }
}
