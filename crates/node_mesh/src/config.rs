//! Node configuration: defaults, TOML loading, and startup validation.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use node_proto::Headers;
use serde::Deserialize;

use crate::error::NodeError;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default = "default_beacon_port")]
    pub beacon_port: u16,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_evasive_timeout_ms")]
    pub evasive_timeout_ms: u64,
    #[serde(default = "default_expired_timeout_ms")]
    pub expired_timeout_ms: u64,
    /// IPv4 address of the interface used for beacons and the advertised endpoint.
    #[serde(default)]
    pub interface: Option<String>,
    /// Fixed TCP port for the peer listener; 0 picks an ephemeral port.
    #[serde(default)]
    pub peer_port: u16,
    #[serde(default)]
    pub gossip: Option<GossipConfig>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

/// Discovery through explicit endpoints instead of UDP beacons.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GossipConfig {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub connect: Vec<String>,
}

fn default_beacon_port() -> u16 {
    5670
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_evasive_timeout_ms() -> u64 {
    5000
}
fn default_expired_timeout_ms() -> u64 {
    30000
}
fn default_event_capacity() -> usize {
    1024
}
fn default_send_timeout_ms() -> u64 {
    5000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            headers: Headers::new(),
            beacon_port: default_beacon_port(),
            interval_ms: default_interval_ms(),
            evasive_timeout_ms: default_evasive_timeout_ms(),
            expired_timeout_ms: default_expired_timeout_ms(),
            interface: None,
            peer_port: 0,
            gossip: None,
            event_capacity: default_event_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl NodeConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("parse node config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::from_toml(&text)
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_beacon_port(mut self, port: u16) -> Self {
        self.beacon_port = port;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = millis(interval);
        self
    }

    pub fn with_evasive_timeout(mut self, timeout: Duration) -> Self {
        self.evasive_timeout_ms = millis(timeout);
        self
    }

    pub fn with_expired_timeout(mut self, timeout: Duration) -> Self {
        self.expired_timeout_ms = millis(timeout);
        self
    }

    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }

    pub fn with_peer_port(mut self, port: u16) -> Self {
        self.peer_port = port;
        self
    }

    pub fn with_gossip_bind(mut self, endpoint: &str) -> Self {
        self.gossip.get_or_insert_with(GossipConfig::default).bind = Some(endpoint.to_string());
        self
    }

    pub fn with_gossip_connect(mut self, endpoint: &str) -> Self {
        self.gossip
            .get_or_insert_with(GossipConfig::default)
            .connect
            .push(endpoint.to_string());
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = millis(timeout);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn evasive_timeout(&self) -> Duration {
        Duration::from_millis(self.evasive_timeout_ms)
    }

    pub fn expired_timeout(&self) -> Duration {
        Duration::from_millis(self.expired_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn interface_addr(&self) -> Option<Ipv4Addr> {
        self.interface.as_deref().and_then(|i| i.parse().ok())
    }

    pub fn validate(&self) -> std::result::Result<(), NodeError> {
        let invalid = |msg: String| Err(NodeError::Config(msg));

        if self.evasive_timeout_ms >= self.expired_timeout_ms {
            return invalid(format!(
                "evasive timeout ({} ms) must be shorter than expired timeout ({} ms)",
                self.evasive_timeout_ms, self.expired_timeout_ms
            ));
        }
        if self.interval_ms == 0 {
            return invalid("discovery interval must be positive".into());
        }
        if self.beacon_port == 0 {
            return invalid("beacon port must be non-zero".into());
        }
        if self.event_capacity == 0 {
            return invalid("event capacity must be positive".into());
        }
        if self.send_timeout_ms == 0 {
            return invalid("send timeout must be positive".into());
        }
        if let Some(interface) = &self.interface {
            if interface.parse::<Ipv4Addr>().is_err() {
                return invalid(format!("interface {interface:?} is not an IPv4 address"));
            }
        }
        if let Some(gossip) = &self.gossip {
            if gossip.bind.is_none() && gossip.connect.is_empty() {
                return invalid("gossip mode needs a bind or connect endpoint".into());
            }
            if let Some(bind) = &gossip.bind {
                if bind.parse::<SocketAddr>().is_err() {
                    return invalid(format!("gossip bind {bind:?} is not host:port"));
                }
            }
            if let Some(empty) = gossip.connect.iter().find(|e| e.trim().is_empty()) {
                return invalid(format!("gossip connect endpoint {empty:?} is empty"));
            }
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.beacon_port, 5670);
        assert_eq!(config.interval(), Duration::from_secs(1));
        assert_eq!(config.evasive_timeout(), Duration::from_millis(5000));
        assert_eq!(config.expired_timeout(), Duration::from_millis(30000));
        assert!(config.gossip.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_toml_with_partial_fields() {
        let config = NodeConfig::from_toml(
            r#"
            name = "alice"
            evasive_timeout_ms = 100
            expired_timeout_ms = 300

            [headers]
            X-Service = "chat"

            [gossip]
            connect = ["10.0.0.5:7000"]
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "alice");
        assert_eq!(config.beacon_port, 5670);
        assert_eq!(config.evasive_timeout(), Duration::from_millis(100));
        assert_eq!(config.headers["X-Service"], "chat");
        assert_eq!(config.gossip.unwrap().connect, vec!["10.0.0.5:7000"]);
    }

    #[test]
    fn rejects_evasive_not_below_expired() {
        let config = NodeConfig::new("n")
            .with_evasive_timeout(Duration::from_millis(300))
            .with_expired_timeout(Duration::from_millis(300));
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn rejects_bad_port_and_interface() {
        assert!(NodeConfig::new("n").with_beacon_port(0).validate().is_err());
        assert!(NodeConfig::new("n").with_interface("eth0").validate().is_err());
        assert!(NodeConfig::new("n")
            .with_interface("192.168.1.20")
            .validate()
            .is_ok());
    }

    #[test]
    fn gossip_needs_valid_endpoints() {
        let empty = NodeConfig {
            gossip: Some(GossipConfig::default()),
            ..NodeConfig::default()
        };
        assert!(empty.validate().is_err());

        assert!(NodeConfig::new("n")
            .with_gossip_bind("not an address")
            .validate()
            .is_err());

        let ok = NodeConfig::new("n")
            .with_gossip_bind("127.0.0.1:0")
            .with_gossip_connect("127.0.0.1:7000");
        assert!(ok.validate().is_ok());
        assert_eq!(
            ok.gossip.as_ref().and_then(|g| g.bind.as_deref()),
            Some("127.0.0.1:0")
        );
    }
}
