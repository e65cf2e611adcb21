//! LAN peer discovery, group membership and messaging.
//!
//! A [`Node`] finds peers with UDP beacons (or gossip seeds), tracks their
//! liveness, keeps a table of who is in which group, and lets the application
//! whisper to one peer or shout to a group. Everything that happens on the
//! network is reported as an [`Event`].

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod event;
pub mod groups;
pub mod membership;
pub mod memory_transport;
pub mod node;
pub mod peer_dir;
pub mod tcp_transport;
pub mod transport;

pub use config::{GossipConfig, NodeConfig};
pub use engine::{Engine, Output, Timeouts};
pub use error::{NodeError, Result};
pub use event::Event;
pub use groups::GroupTable;
pub use membership::{Peer, PeerState, TransitionError};
pub use memory_transport::{MemoryNetwork, MemoryTransport};
pub use node::{Node, NodeState};
pub use peer_dir::{PeerDirectory, RegistryError, Upsert};
pub use tcp_transport::TcpTransport;
pub use transport::{Inbound, Listener, PeerStream, Transport};
