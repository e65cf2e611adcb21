//! The node facade: the one object an application holds.
//!
//! A started node runs a single driver task. The driver owns every write to
//! the engine; commands reach it through an ordered queue and events leave
//! through a bounded queue read by [`Node::recv`]. Queries take a read lock
//! on the engine and never go through the driver.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use node_proto::Headers;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::discovery::Discovery;
use crate::engine::{Engine, Output, Timeouts};
use crate::error::{NodeError, Result};
use crate::event::Event;
use crate::tcp_transport::TcpTransport;
use crate::transport::{Inbound, Listener, PeerStream, Transport};

const COMMAND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

enum Lifecycle {
    Created,
    Started {
        commands: mpsc::Sender<Command>,
        task: JoinHandle<()>,
    },
    Stopped,
    Destroyed,
}

enum Request {
    Join { group: String },
    Leave { group: String },
    Whisper { peer: String, payload: Vec<u8> },
    Shout { group: String, payload: Vec<u8> },
}

enum Command {
    Apply {
        request: Request,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Events not yet handed to the application. `backlog` holds events pulled
/// off the channel while stopping and is served first.
#[derive(Default)]
struct EventQueue {
    rx: Option<mpsc::Receiver<Event>>,
    backlog: VecDeque<Event>,
}

pub struct Node {
    id: String,
    name: String,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    engine: Arc<RwLock<Engine>>,
    lifecycle: Mutex<Lifecycle>,
    events: Mutex<EventQueue>,
}

impl Node {
    /// A node on the real network: TCP peer streams, UDP beacons or gossip.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let transport =
            TcpTransport::new(&config).map_err(|e| NodeError::Config(format!("{e:#}")))?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: NodeConfig, transport: Arc<dyn Transport>) -> Self {
        let id = Uuid::new_v4().simple().to_string().to_uppercase();
        let name = if config.name.is_empty() {
            id[..6].to_string()
        } else {
            config.name.clone()
        };
        let engine = Engine::new(
            &id,
            &name,
            config.headers.clone(),
            Timeouts {
                evasive: config.evasive_timeout(),
                expired: config.expired_timeout(),
            },
        );
        Self {
            id,
            name,
            config,
            transport,
            engine: Arc::new(RwLock::new(engine)),
            lifecycle: Mutex::new(Lifecycle::Created),
            events: Mutex::new(EventQueue::default()),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn headers(&self) -> &Headers {
        &self.config.headers
    }

    pub async fn state(&self) -> NodeState {
        match &*self.lifecycle.lock().await {
            Lifecycle::Created => NodeState::Created,
            Lifecycle::Started { .. } => NodeState::Started,
            Lifecycle::Stopped => NodeState::Stopped,
            Lifecycle::Destroyed => NodeState::Destroyed,
        }
    }

    /// Validate the configuration, open the transport and start the driver.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Created) {
            return Err(NodeError::AlreadyStarted);
        }
        self.config.validate()?;
        let discovery =
            Discovery::from_config(&self.config).map_err(|e| NodeError::Config(format!("{e:#}")))?;

        let listener = self.transport.listen().await.map_err(NodeError::Transport)?;
        {
            let mut engine = self.engine.write().await;
            engine.bind(&listener.endpoint, listener.port);
            engine.set_seeds(discovery.seeds().to_vec());
        }
        info!(
            "node {} ({}) listening at {}",
            self.id, self.name, listener.endpoint
        );

        let (events_tx, events_rx) = mpsc::channel(self.config.event_capacity);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        *self.events.lock().await = EventQueue {
            rx: Some(events_rx),
            backlog: VecDeque::new(),
        };

        let driver = Driver {
            engine: Arc::clone(&self.engine),
            transport: Arc::clone(&self.transport),
            streams: HashMap::new(),
            endpoints: HashMap::new(),
            events: events_tx,
            beacons: discovery.beacons(),
            interval: self.config.interval(),
        };
        *lifecycle = Lifecycle::Started {
            commands: commands_tx,
            task: tokio::spawn(driver.run(listener, commands_rx)),
        };
        Ok(())
    }

    /// Notify peers and shut the driver down. Events already queued can
    /// still be read; after that `recv` returns `Closed`.
    ///
    /// While waiting for the driver, pending events are moved into an
    /// unbounded backlog, so a full event queue cannot stall shutdown even
    /// when the caller is its only reader.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped);
        let (commands, task) = match previous {
            Lifecycle::Started { commands, task } => (commands, task),
            Lifecycle::Destroyed => {
                *lifecycle = Lifecycle::Destroyed;
                return;
            }
            Lifecycle::Created | Lifecycle::Stopped => return,
        };
        drop(lifecycle);

        let (reply, done) = oneshot::channel();
        let shutdown = async move {
            if commands.send(Command::Stop { reply }).await.is_ok() {
                let _ = done.await;
            }
        };
        tokio::pin!(shutdown);
        let mut draining = true;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                more = self.buffer_event(), if draining => draining = more,
            }
        }
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!("driver task failed: {e}");
            }
        }
        info!("node {} stopped", self.id);
    }

    /// Tear down immediately and discard undelivered events.
    pub async fn destroy(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock().await, Lifecycle::Destroyed);
        if let Lifecycle::Started { task, .. } = previous {
            task.abort();
            debug!("node {} destroyed", self.id);
        }
        *self.events.lock().await = EventQueue::default();
    }

    pub async fn join(&self, group: &str) -> Result<()> {
        check_group(group)?;
        self.command(Request::Join {
            group: group.to_string(),
        })
        .await
    }

    pub async fn leave(&self, group: &str) -> Result<()> {
        check_group(group)?;
        self.command(Request::Leave {
            group: group.to_string(),
        })
        .await
    }

    pub async fn whisper(&self, peer: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        if peer.is_empty() {
            return Err(NodeError::InvalidArgument("peer id is empty".into()));
        }
        self.command(Request::Whisper {
            peer: peer.to_string(),
            payload: payload.into(),
        })
        .await
    }

    pub async fn shout(&self, group: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        check_group(group)?;
        self.command(Request::Shout {
            group: group.to_string(),
            payload: payload.into(),
        })
        .await
    }

    pub async fn whisper_str(&self, peer: &str, text: &str) -> Result<()> {
        self.whisper(peer, text.as_bytes()).await
    }

    pub async fn shout_str(&self, group: &str, text: &str) -> Result<()> {
        self.shout(group, text.as_bytes()).await
    }

    async fn command(&self, request: Request) -> Result<()> {
        let commands = match &*self.lifecycle.lock().await {
            Lifecycle::Started { commands, .. } => commands.clone(),
            _ => return Err(NodeError::NotStarted),
        };
        let (reply, response) = oneshot::channel();
        commands
            .send(Command::Apply { request, reply })
            .await
            .map_err(|_| NodeError::Closed)?;
        response.await.map_err(|_| NodeError::Closed)?
    }

    /// Next event in arrival order. Waits until one is available.
    pub async fn recv(&self) -> Result<Event> {
        {
            let mut events = self.events.lock().await;
            if let Some(event) = events.backlog.pop_front() {
                return Ok(event);
            }
            if let Some(rx) = events.rx.as_mut() {
                if let Some(event) = rx.recv().await {
                    return Ok(event);
                }
                events.rx = None;
            }
        }
        match &*self.lifecycle.lock().await {
            Lifecycle::Created => Err(NodeError::NotStarted),
            _ => Err(NodeError::Closed),
        }
    }

    /// Move one event from the channel to the backlog. Returns `false` once
    /// the driver has dropped its sender.
    async fn buffer_event(&self) -> bool {
        let mut guard = self.events.lock().await;
        let queue = &mut *guard;
        let Some(rx) = queue.rx.as_mut() else {
            return false;
        };
        match rx.recv().await {
            Some(event) => {
                queue.backlog.push_back(event);
                true
            }
            None => false,
        }
    }

    /// Ids of peers that completed the handshake.
    pub async fn peers(&self) -> Vec<String> {
        self.engine.read().await.peers()
    }

    pub async fn peers_by_group(&self, group: &str) -> Vec<String> {
        self.engine.read().await.peers_by_group(group)
    }

    pub async fn peer_header_value(&self, peer: &str, key: &str) -> Option<String> {
        self.engine.read().await.peer_header_value(peer, key)
    }

    pub async fn peer_address(&self, peer: &str) -> Option<String> {
        self.engine.read().await.peer_address(peer)
    }

    pub async fn peer_groups(&self) -> Vec<String> {
        self.engine.read().await.peer_groups()
    }

    pub async fn own_groups(&self) -> Vec<String> {
        self.engine.read().await.own_groups()
    }

    /// Endpoint peers reach us on, once started.
    pub async fn endpoint(&self) -> Option<String> {
        let engine = self.engine.read().await;
        let endpoint = &engine.local().endpoint;
        (!endpoint.is_empty()).then(|| endpoint.clone())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Lifecycle::Started { task, .. } = self.lifecycle.get_mut() {
            task.abort();
        }
    }
}

fn check_group(group: &str) -> Result<()> {
    if group.is_empty() {
        return Err(NodeError::InvalidArgument("group name is empty".into()));
    }
    Ok(())
}

/// Executes engine outputs against the transport.
struct Driver {
    engine: Arc<RwLock<Engine>>,
    transport: Arc<dyn Transport>,
    streams: HashMap<String, Box<dyn PeerStream>>,
    endpoints: HashMap<String, String>,
    events: mpsc::Sender<Event>,
    beacons: bool,
    interval: Duration,
}

impl Driver {
    async fn run(mut self, mut listener: Listener, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                inbound = listener.inbound.recv() => match inbound {
                    Some(inbound) => self.on_inbound(inbound).await,
                    None => {
                        warn!("transport listener closed");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Stop { reply }) => {
                        // Frames that already arrived are still delivered.
                        while let Ok(inbound) = listener.inbound.try_recv() {
                            self.on_inbound(inbound).await;
                        }
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(Command::Apply { request, reply }) => {
                        let result = self.apply(request).await;
                        let _ = reply.send(result);
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
        debug!("driver finished");
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let (outputs, beacon) = {
            let mut engine = self.engine.write().await;
            let beacon = self.beacons.then(|| engine.beacon());
            (engine.tick(now), beacon)
        };
        if let Some(beacon) = beacon {
            if let Err(e) = self.transport.broadcast(&beacon).await {
                warn!("beacon failed: {e:#}");
            }
        }
        self.execute(outputs).await;
    }

    async fn on_inbound(&mut self, inbound: Inbound) {
        let now = Instant::now();
        let outputs = {
            let mut engine = self.engine.write().await;
            match &inbound {
                Inbound::Beacon { host, frame } => engine.handle_beacon(host, frame, now),
                Inbound::Frame { from, frame } => engine.handle_frame(from, frame, now),
            }
        };
        self.execute(outputs).await;
    }

    async fn apply(&mut self, request: Request) -> Result<()> {
        let outputs = {
            let mut engine = self.engine.write().await;
            match request {
                Request::Join { group } => engine.join(&group),
                Request::Leave { group } => engine.leave(&group),
                Request::Whisper { peer, payload } => engine.whisper(&peer, payload)?,
                Request::Shout { group, payload } => engine.shout(&group, payload),
            }
        };
        self.execute(outputs).await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let (outputs, farewell) = {
            let mut engine = self.engine.write().await;
            let farewell = self.beacons.then(|| engine.farewell_beacon());
            (engine.stop(), farewell)
        };
        self.execute(outputs).await;
        if let Some(farewell) = farewell {
            if let Err(e) = self.transport.broadcast(&farewell).await {
                debug!("farewell beacon failed: {e:#}");
            }
        }
        self.streams.clear();
    }

    async fn execute(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Connect { peer, endpoint } => {
                    self.endpoints.insert(peer.clone(), endpoint.clone());
                    match self.transport.connect(&endpoint).await {
                        Ok(stream) => {
                            self.streams.insert(peer, stream);
                        }
                        Err(e) => {
                            warn!("connect to {peer} at {endpoint} failed: {e:#}");
                            self.streams.remove(&peer);
                        }
                    }
                }
                Output::Send { peer, frame } => self.send(&peer, &frame).await,
                Output::Introduce { endpoint, frame } => {
                    let result = match self.transport.connect(&endpoint).await {
                        Ok(mut stream) => stream.send(&frame).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        debug!("introduction to {endpoint} failed: {e:#}");
                    }
                }
                Output::Disconnect { peer } => {
                    self.streams.remove(&peer);
                    self.endpoints.remove(&peer);
                }
                Output::Event(event) => {
                    if self.events.send(event).await.is_err() {
                        debug!("event receiver is gone");
                    }
                }
            }
        }
    }

    /// Failures are logged and leave the peer's liveness untouched.
    async fn send(&mut self, peer: &str, frame: &[u8]) {
        if !self.streams.contains_key(peer) {
            let Some(endpoint) = self.endpoints.get(peer).cloned() else {
                debug!("no stream to {peer}, dropping frame");
                return;
            };
            match self.transport.connect(&endpoint).await {
                Ok(stream) => {
                    self.streams.insert(peer.to_string(), stream);
                }
                Err(e) => {
                    warn!("reconnect to {peer} at {endpoint} failed: {e:#}");
                    return;
                }
            }
        }
        if let Some(stream) = self.streams.get_mut(peer) {
            if let Err(e) = stream.send(frame).await {
                warn!("send to {peer} failed: {e:#}");
                self.streams.remove(peer);
            }
        }
    }
}
