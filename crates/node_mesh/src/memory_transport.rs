//! In-process transport: every node attached to one [`MemoryNetwork`] can
//! see the others' beacons and open streams to them by `mem:N` endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{Inbound, Listener, PeerStream, Transport};

const INBOUND_CAPACITY: usize = 1024;
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const HOST: &str = "mem";

#[derive(Default)]
struct Hub {
    last_port: u16,
    listeners: HashMap<String, mpsc::Sender<Inbound>>,
}

#[derive(Default)]
pub struct MemoryNetwork {
    hub: Mutex<Hub>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport attached to this network. Each node needs its own.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            network: Arc::clone(self),
            endpoint: OnceLock::new(),
        }
    }

    fn hub(&self) -> std::sync::MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    endpoint: OnceLock<String>,
}

struct MemoryStream {
    from: String,
    to: String,
    tx: mpsc::Sender<Inbound>,
}

#[async_trait::async_trait]
impl PeerStream for MemoryStream {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let inbound = Inbound::Frame {
            from: self.from.clone(),
            frame: frame.to_vec(),
        };
        tokio::time::timeout(SEND_TIMEOUT, self.tx.send(inbound))
            .await
            .with_context(|| format!("send to {} timed out", self.to))?
            .map_err(|_| anyhow!("{} is gone", self.to))
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self) -> Result<Listener> {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut hub = self.network.hub();
        hub.last_port = hub
            .last_port
            .checked_add(1)
            .context("memory network is out of ports")?;
        let port = hub.last_port;
        let endpoint = format!("{HOST}:{port}");
        if self.endpoint.set(endpoint.clone()).is_err() {
            bail!("transport is already listening");
        }
        hub.listeners.insert(endpoint.clone(), tx);
        debug!("memory listener at {endpoint}");
        Ok(Listener::new(endpoint, port, rx))
    }

    async fn broadcast(&self, frame: &[u8]) -> Result<()> {
        let mut hub = self.network.hub();
        hub.listeners.retain(|_, tx| !tx.is_closed());
        for tx in hub.listeners.values() {
            // Beacons are best effort, like UDP.
            let _ = tx.try_send(Inbound::Beacon {
                host: HOST.to_string(),
                frame: frame.to_vec(),
            });
        }
        Ok(())
    }

    async fn connect(&self, endpoint: &str) -> Result<Box<dyn PeerStream>> {
        let tx = self
            .network
            .hub()
            .listeners
            .get(endpoint)
            .cloned()
            .with_context(|| format!("no listener at {endpoint}"))?;
        if tx.is_closed() {
            bail!("listener at {endpoint} is closed");
        }
        let from = self
            .endpoint
            .get()
            .cloned()
            .unwrap_or_else(|| format!("{HOST}:?"));
        Ok(Box::new(MemoryStream {
            from,
            to: endpoint.to_string(),
            tx,
        }))
    }
}
