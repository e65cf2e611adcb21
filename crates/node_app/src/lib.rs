//! Command line front end for `meshchat`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use node_mesh::{Event, NodeConfig};

/// Read from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG: &str = "meshchat.toml";

/// Chat with every node on the local network that joined the same group.
#[derive(Parser, Debug)]
#[command(name = "meshchat")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Name shown to other peers
    #[arg(long)]
    pub name: Option<String>,

    /// Group to join and shout to
    #[arg(long, default_value = "CHAT")]
    pub group: String,

    /// UDP beacon port
    #[arg(long)]
    pub port: Option<u16>,

    /// Beacon and liveness check interval
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Silence before a peer is reported evasive
    #[arg(long)]
    pub evasive_ms: Option<u64>,

    /// Silence before a peer is dropped
    #[arg(long)]
    pub expired_ms: Option<u64>,

    /// IPv4 address of the interface to announce
    #[arg(long)]
    pub interface: Option<String>,

    /// Use gossip discovery, listening on this endpoint
    #[arg(long)]
    pub gossip_bind: Option<String>,

    /// Gossip seed endpoint (repeatable)
    #[arg(long)]
    pub gossip_connect: Vec<String>,

    /// Header sent to peers as key=value (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Config file (explicit, or `meshchat.toml` when present) with flags on top.
    pub fn node_config(&self) -> Result<NodeConfig> {
        let base = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None if Path::new(DEFAULT_CONFIG).exists() => {
                NodeConfig::load(Path::new(DEFAULT_CONFIG))?
            }
            None => NodeConfig::default(),
        };
        Ok(self.apply(base))
    }

    pub fn apply(&self, mut config: NodeConfig) -> NodeConfig {
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(port) = self.port {
            config = config.with_beacon_port(port);
        }
        if let Some(ms) = self.interval_ms {
            config = config.with_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.evasive_ms {
            config = config.with_evasive_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.expired_ms {
            config = config.with_expired_timeout(Duration::from_millis(ms));
        }
        if let Some(interface) = &self.interface {
            config = config.with_interface(interface);
        }
        if let Some(bind) = &self.gossip_bind {
            config = config.with_gossip_bind(bind);
        }
        for seed in &self.gossip_connect {
            config = config.with_gossip_connect(seed);
        }
        for (key, value) in &self.headers {
            config = config.with_header(key, value);
        }
        config
    }
}

pub fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// One line of chat output per event.
pub fn format_event(event: &Event) -> String {
    match event {
        Event::Enter { name, endpoint, .. } => format!("* {name} entered ({endpoint})"),
        Event::Evasive { name, .. } => format!("* {name} is not responding"),
        Event::Exit { name, .. } => format!("* {name} left"),
        Event::Join { name, group, .. } => format!("* {name} joined {group}"),
        Event::Leave { name, group, .. } => format!("* {name} left {group}"),
        Event::Whisper { name, payload, .. } => {
            format!("{name} (private): {}", String::from_utf8_lossy(payload))
        }
        Event::Shout {
            name,
            group,
            payload,
            ..
        } => format!("{name}@{group}: {}", String::from_utf8_lossy(payload)),
        Event::Stop { name, .. } => format!("* {name} stopped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("meshchat").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let args = args(&[]);
        assert_eq!(args.group, "CHAT");
        assert!(args.headers.is_empty());

        let config = args.apply(NodeConfig::default());
        assert_eq!(config.beacon_port, 5670);
        assert!(config.gossip.is_none());
    }

    #[test]
    fn flags_override_config() {
        let args = args(&[
            "--name", "alice",
            "--port", "5999",
            "--interval-ms", "250",
            "--evasive-ms", "1000",
            "--expired-ms", "4000",
            "--header", "X-Role=chat",
            "--header", "X-Lang = en",
        ]);
        let config = args.apply(NodeConfig::new("file-name").with_beacon_port(6000));
        assert_eq!(config.name, "alice");
        assert_eq!(config.beacon_port, 5999);
        assert_eq!(config.interval(), Duration::from_millis(250));
        assert_eq!(config.evasive_timeout(), Duration::from_secs(1));
        assert_eq!(config.expired_timeout(), Duration::from_secs(4));
        assert_eq!(config.headers.get("X-Role").map(String::as_str), Some("chat"));
        assert_eq!(config.headers.get("X-Lang").map(String::as_str), Some("en"));
    }

    #[test]
    fn gossip_flags() {
        let args = args(&[
            "--gossip-bind", "127.0.0.1:7000",
            "--gossip-connect", "127.0.0.1:7001",
            "--gossip-connect", "127.0.0.1:7002",
        ]);
        let gossip = args.apply(NodeConfig::default()).gossip.unwrap();
        assert_eq!(gossip.bind.as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(gossip.connect, vec!["127.0.0.1:7001", "127.0.0.1:7002"]);
    }

    #[test]
    fn header_parsing() {
        assert_eq!(
            parse_header("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_header("k=").unwrap(), ("k".to_string(), String::new()));
        assert!(parse_header("novalue").is_err());
        assert!(parse_header("=v").is_err());
        assert!(Args::try_parse_from(["meshchat", "--header", "bad"]).is_err());
    }

    #[test]
    fn event_lines() {
        let shout = Event::Shout {
            peer: "ID".into(),
            name: "bob".into(),
            group: "CHAT".into(),
            payload: b"hi all".to_vec(),
        };
        assert_eq!(format_event(&shout), "bob@CHAT: hi all");

        let exit = Event::Exit {
            peer: "ID".into(),
            name: "bob".into(),
        };
        assert_eq!(format_event(&exit), "* bob left");
    }
}
