//! How a node finds its peers: UDP beacons on the LAN, or gossip seeds.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::NodeConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// Broadcast beacons on this UDP port and listen for others.
    Beacon { port: u16 },
    /// No beaconing: listen on `bind` (if given) and introduce ourselves to `seeds`.
    Gossip {
        bind: Option<SocketAddr>,
        seeds: Vec<String>,
    },
}

impl Discovery {
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let Some(gossip) = &config.gossip else {
            return Ok(Self::Beacon {
                port: config.beacon_port,
            });
        };
        let bind = gossip
            .bind
            .as_deref()
            .map(|b| b.parse::<SocketAddr>())
            .transpose()
            .context("parse gossip bind endpoint")?;
        Ok(Self::Gossip {
            bind,
            seeds: gossip.connect.clone(),
        })
    }

    pub fn beacons(&self) -> bool {
        matches!(self, Self::Beacon { .. })
    }

    pub fn seeds(&self) -> &[String] {
        match self {
            Self::Beacon { .. } => &[],
            Self::Gossip { seeds, .. } => seeds,
        }
    }
}

/// Best guess at the IPv4 address other hosts can reach us on.
///
/// Connecting a UDP socket picks the outbound interface without sending
/// anything. Falls back to loopback when there is no route.
pub fn local_ipv4() -> Ipv4Addr {
    let probe = || -> Result<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("bind probe socket")?;
        socket
            .connect((Ipv4Addr::new(192, 0, 2, 1), 9))
            .context("route probe")?;
        match socket.local_addr().context("probe address")?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            other => anyhow::bail!("no usable IPv4 address ({other})"),
        }
    };
    probe().unwrap_or_else(|e| {
        debug!("falling back to loopback: {e:#}");
        Ipv4Addr::LOCALHOST
    })
}

/// Port part of a `host:port` endpoint.
pub fn endpoint_port(endpoint: &str) -> Option<u16> {
    endpoint
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_mode_by_default() {
        let config = NodeConfig::new("alice").with_beacon_port(5999);
        let discovery = Discovery::from_config(&config).unwrap();
        assert_eq!(discovery, Discovery::Beacon { port: 5999 });
        assert!(discovery.beacons());
        assert!(discovery.seeds().is_empty());
    }

    #[test]
    fn gossip_mode_from_config() {
        let config = NodeConfig::new("alice")
            .with_gossip_bind("127.0.0.1:7000")
            .with_gossip_connect("127.0.0.1:7001");
        let discovery = Discovery::from_config(&config).unwrap();
        assert!(!discovery.beacons());
        assert_eq!(discovery.seeds(), ["127.0.0.1:7001".to_string()]);
        assert_eq!(
            discovery,
            Discovery::Gossip {
                bind: Some("127.0.0.1:7000".parse().unwrap()),
                seeds: vec!["127.0.0.1:7001".into()],
            }
        );
    }

    #[test]
    fn bad_gossip_bind_is_an_error() {
        let config = NodeConfig::new("alice").with_gossip_bind("nowhere");
        assert!(Discovery::from_config(&config).is_err());
    }

    #[test]
    fn endpoint_ports() {
        assert_eq!(endpoint_port("192.168.1.10:49152"), Some(49152));
        assert_eq!(endpoint_port("mem:3"), Some(3));
        assert_eq!(endpoint_port("no-port"), None);
        assert_eq!(endpoint_port("host:99999"), None);
    }

    #[test]
    fn local_address_is_ipv4() {
        let ip = local_ipv4();
        assert!(!ip.is_unspecified());
    }
}
