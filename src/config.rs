//! `ProxyConfig`: listen address, tunnel peer target, timeout overrides,
//! the static host-match rule list, and logging knobs.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the dual-protocol listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Address of the `FramedTcpTunnel` peer.
    pub tunnel_addr: SocketAddr,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub host_match: HostMatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:1080".parse().unwrap()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_addr: default_listen_addr(),
            tunnel_addr: "127.0.0.1:9000".parse().unwrap(),
            timeouts: TimeoutConfig::default(),
            host_match: HostMatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Overrides for handshake/idle timeouts across the session lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_tcp_idle_timeout_secs")]
    pub tcp_idle_secs: u64,
    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_secs: u64,
}

fn default_handshake_timeout_secs() -> u64 {
    15
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_tcp_idle_timeout_secs() -> u64 {
    300
}
fn default_udp_idle_timeout_secs() -> u64 {
    180
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            handshake_secs: default_handshake_timeout_secs(),
            connect_secs: default_connect_timeout_secs(),
            tcp_idle_secs: default_tcp_idle_timeout_secs(),
            udp_idle_secs: default_udp_idle_timeout_secs(),
        }
    }
}

/// Static domain-suffix rule list backing `SuffixHostMatcher`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostMatchConfig {
    #[serde(default)]
    pub tunnel_suffixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit structured JSON lifecycle events via `json_logger` in addition
    /// to plain `log` output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { json: false }
    }
}

impl ProxyConfig {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.timeouts.handshake_secs == 0 {
            return Err("timeouts.handshake_secs must be non-zero".to_string());
        }
        if self.timeouts.connect_secs == 0 {
            return Err("timeouts.connect_secs must be non-zero".to_string());
        }
        for suffix in &self.host_match.tunnel_suffixes {
            if suffix.is_empty() {
                return Err("host_match.tunnel_suffixes entries must be non-empty".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_handshake_timeout() {
        let mut config = ProxyConfig::default();
        config.timeouts.handshake_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_suffix_rule() {
        let mut config = ProxyConfig::default();
        config.host_match.tunnel_suffixes.push(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = ProxyConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: ProxyConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.listen_addr, config.listen_addr);
    }
}
