//! Transport abstraction for peer-to-peer communication.
//!
//! A transport gives a node three things: a broadcast channel for beacons,
//! a listener that yields everything sent to us, and outbound streams to
//! individual peers. Inbound peer traffic from every connection arrives on
//! the single listener channel.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Something that arrived for this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A discovery beacon; `host` is the sender's address without port.
    Beacon { host: String, frame: Vec<u8> },
    /// A frame on a peer stream; `from` names the connection.
    Frame { from: String, frame: Vec<u8> },
}

/// A running listener. Dropping it stops the background tasks.
pub struct Listener {
    /// Endpoint other peers connect to.
    pub endpoint: String,
    /// Port advertised in beacons.
    pub port: u16,
    pub inbound: mpsc::Receiver<Inbound>,
    tasks: Vec<JoinHandle<()>>,
}

impl Listener {
    pub fn new(endpoint: String, port: u16, inbound: mpsc::Receiver<Inbound>) -> Self {
        Self {
            endpoint,
            port,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Tie a background task to this listener's lifetime.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Outbound half of a peer connection.
#[async_trait::async_trait]
pub trait PeerStream: Send {
    async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()>;
}

/// Transport abstraction trait. Implementations handle the wire protocol.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting peer connections and beacons.
    async fn listen(&self) -> anyhow::Result<Listener>;

    /// Send a beacon to every node on the discovery channel.
    async fn broadcast(&self, frame: &[u8]) -> anyhow::Result<()>;

    /// Open a stream to a peer endpoint.
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Box<dyn PeerStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_listener_aborts_tasks() {
        let (_tx, rx) = mpsc::channel(1);
        let mut listener = Listener::new("mem:1".into(), 1, rx);
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        listener.attach(tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await
        }));

        drop(listener);
        let closed = tokio::time::timeout(std::time::Duration::from_secs(1), alive_rx)
            .await
            .unwrap();
        assert!(closed.is_err());
    }
}
