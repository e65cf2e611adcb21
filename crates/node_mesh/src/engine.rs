//! Protocol engine: discovery, handshake, liveness and message dispatch.
//!
//! The engine never touches a socket. Every entry point takes the current
//! time and returns the I/O to perform as a list of [`Output`]s, which the
//! node driver executes in order. That keeps all peer and group state behind
//! a single writer and makes the timing rules testable with plain `Instant`s.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use node_proto::{decode, decode_beacon, encode, encode_beacon, BeaconInfo, Frame, Headers, Message};
use tracing::{debug, info, warn};

use crate::discovery::endpoint_port;
use crate::error::NodeError;
use crate::event::Event;
use crate::groups::GroupTable;
use crate::membership::{Peer, PeerState};
use crate::peer_dir::{PeerDirectory, Upsert};

/// Sequence number of a gossip introduction HELLO. Stream frames start at 1.
pub const INTRODUCTION_SEQUENCE: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub evasive: Duration,
    pub expired: Duration,
}

/// I/O requested by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Open (or replace) the outbound stream to `peer`.
    Connect { peer: String, endpoint: String },
    /// Write an encoded frame on the peer's stream.
    Send { peer: String, frame: Vec<u8> },
    /// One-shot frame to an endpoint that is not a known peer yet.
    Introduce { endpoint: String, frame: Vec<u8> },
    /// Close the peer's stream.
    Disconnect { peer: String },
    Event(Event),
}

/// This process's own identity as seen by other peers.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub id: String,
    pub name: String,
    pub headers: Headers,
    pub endpoint: String,
    pub port: u16,
    groups: BTreeSet<String>,
    status: u8,
}

impl LocalNode {
    pub fn groups(&self) -> Vec<String> {
        self.groups.iter().cloned().collect()
    }

    pub fn status(&self) -> u8 {
        self.status
    }
}

/// A gossip endpoint and when we last introduced ourselves to it.
#[derive(Debug, Clone)]
struct Seed {
    endpoint: String,
    introduced: Option<Instant>,
}

pub struct Engine {
    local: LocalNode,
    peers: PeerDirectory,
    groups: GroupTable,
    timeouts: Timeouts,
    seeds: Vec<Seed>,
}

impl Engine {
    pub fn new(id: &str, name: &str, headers: Headers, timeouts: Timeouts) -> Self {
        Self {
            local: LocalNode {
                id: id.to_string(),
                name: name.to_string(),
                headers,
                endpoint: String::new(),
                port: 0,
                groups: BTreeSet::new(),
                status: 0,
            },
            peers: PeerDirectory::new(),
            groups: GroupTable::new(),
            timeouts,
            seeds: Vec::new(),
        }
    }

    /// Record where peers can reach us. Called once the listener is up.
    pub fn bind(&mut self, endpoint: &str, port: u16) {
        self.local.endpoint = endpoint.to_string();
        self.local.port = port;
    }

    /// Endpoints to introduce ourselves to until a peer with that endpoint
    /// is known. Unanswered seeds are retried once per evasive timeout.
    pub fn set_seeds(&mut self, seeds: Vec<String>) {
        self.seeds = seeds
            .into_iter()
            .map(|endpoint| Seed {
                endpoint,
                introduced: None,
            })
            .collect();
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    pub fn beacon(&self) -> Vec<u8> {
        encode_beacon(&BeaconInfo {
            node_id: self.local.id.clone(),
            name: self.local.name.clone(),
            port: self.local.port,
        })
    }

    /// A beacon with port 0 tells listeners we are going away.
    pub fn farewell_beacon(&self) -> Vec<u8> {
        encode_beacon(&BeaconInfo {
            node_id: self.local.id.clone(),
            name: self.local.name.clone(),
            port: 0,
        })
    }

    pub fn handle_beacon(&mut self, host: &str, bytes: &[u8], now: Instant) -> Vec<Output> {
        let beacon = match decode_beacon(bytes) {
            Ok(beacon) => beacon,
            Err(e) => {
                debug!("dropping beacon from {host}: {e}");
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        if beacon.node_id == self.local.id {
            return out;
        }

        if beacon.port == 0 {
            if self.peers.contains(&beacon.node_id) {
                debug!("peer {} announced departure", beacon.node_id);
                self.remove_peer(&beacon.node_id, &mut out);
            }
            return out;
        }

        let endpoint = format!("{host}:{}", beacon.port);
        let connect = match self.peers.mark_seen(&beacon.node_id, now) {
            Some(_) => self.relocate(&beacon.node_id, &endpoint, beacon.port),
            None => {
                debug!("beacon from new peer {} at {endpoint}", beacon.node_id);
                self.peers
                    .insert_connecting(&beacon.node_id, &endpoint, now);
                true
            }
        };

        if connect {
            out.push(Output::Connect {
                peer: beacon.node_id.clone(),
                endpoint,
            });
            out.extend(self.hello_for(&beacon.node_id));
        }
        out
    }

    /// Point a ready peer at the port from its latest beacon. Returns whether it moved.
    fn relocate(&mut self, id: &str, endpoint: &str, port: u16) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        if !peer.is_ready() || endpoint_port(&peer.endpoint) == Some(port) {
            return false;
        }
        info!("peer {id} moved to {endpoint}");
        peer.endpoint = endpoint.to_string();
        true
    }

    pub fn handle_frame(&mut self, from: &str, bytes: &[u8], now: Instant) -> Vec<Output> {
        let frame = match decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping frame from {from}: {e}");
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        if frame.sender == self.local.id {
            return out;
        }
        if matches!(frame.message, Message::Hello { .. }) {
            self.on_hello(frame, now, &mut out);
            return out;
        }

        let sender = frame.sender;
        let Some(peer) = self.peers.get_mut(&sender).filter(|p| p.is_ready()) else {
            debug!(
                "dropping {} from {sender}: no handshake yet",
                frame.message.kind()
            );
            return out;
        };
        if !peer.accept_sequence(frame.sequence) {
            warn!(
                "sequence gap from {sender}: expected {}, got {}; dropping peer",
                peer.expected_sequence(),
                frame.sequence
            );
            self.remove_peer(&sender, &mut out);
            return out;
        }
        let name = peer.name.clone();
        if self.peers.mark_seen(&sender, now) == Some(true) {
            debug!("peer {sender} is back");
        }

        match frame.message {
            Message::Whisper { payload } => out.push(Output::Event(Event::Whisper {
                peer: sender,
                name,
                payload,
            })),
            Message::Shout { group, payload } => {
                if self.local.groups.contains(&group) {
                    out.push(Output::Event(Event::Shout {
                        peer: sender,
                        name,
                        group,
                        payload,
                    }));
                } else {
                    debug!("ignoring shout to {group}: not a member");
                }
            }
            Message::Join { group, status } => {
                self.check_status(&sender, status);
                if self.groups.join(&sender, &group) {
                    out.push(Output::Event(Event::Join {
                        peer: sender,
                        name,
                        group,
                    }));
                }
            }
            Message::Leave { group, status } => {
                self.check_status(&sender, status);
                if self.groups.leave(&sender, &group) {
                    out.push(Output::Event(Event::Leave {
                        peer: sender,
                        name,
                        group,
                    }));
                }
            }
            Message::Ping => out.extend(self.send_to(&sender, Message::PingOk)),
            Message::Stop => {
                info!("peer {sender} ({name}) stopped");
                self.remove_peer(&sender, &mut out);
                out.push(Output::Event(Event::Stop { peer: sender, name }));
            }
            Message::Unknown { kind, .. } => debug!("ignoring unknown message kind {kind}"),
            Message::PingOk | Message::Hello { .. } => {}
        }
        out
    }

    fn on_hello(&mut self, frame: Frame, now: Instant, out: &mut Vec<Output>) {
        let Frame {
            sender,
            sequence,
            message,
        } = frame;
        let Message::Hello {
            endpoint,
            groups,
            status,
            name,
            headers,
        } = message
        else {
            return;
        };
        let introduction = sequence == INTRODUCTION_SEQUENCE;
        if !introduction && sequence != 1 {
            warn!("HELLO from {sender} has sequence {sequence}, ignoring");
            return;
        }
        // An introduction travels outside the sender's stream to us, so it
        // must not touch sequence state for a peer we already track.
        if introduction && self.peers.contains(&sender) {
            debug!("introduction from known peer {sender}");
            self.peers.mark_seen(&sender, now);
            return;
        }

        let known = self.peers.contains(&sender);
        let outcome = match self
            .peers
            .upsert(&sender, &endpoint, &name, headers.clone(), now)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("handshake with {sender} failed: {e}");
                return;
            }
        };
        if let Some(peer) = self.peers.get_mut(&sender) {
            peer.reset_recv_seq(sequence);
            peer.set_status(status);
        }

        match outcome {
            Upsert::Entered => {
                info!("peer {sender} ({name}) entered from {endpoint}");
                if !known {
                    out.push(Output::Connect {
                        peer: sender.clone(),
                        endpoint: endpoint.clone(),
                    });
                    out.extend(self.hello_for(&sender));
                }
                out.push(Output::Event(Event::Enter {
                    peer: sender.clone(),
                    name: name.clone(),
                    headers,
                    endpoint,
                }));
            }
            Upsert::Reconnected => {
                info!("peer {sender} reconnected from {endpoint}");
                out.push(Output::Connect {
                    peer: sender.clone(),
                    endpoint,
                });
                out.extend(self.hello_for(&sender));
            }
            Upsert::Refreshed => debug!("repeat HELLO from {sender}"),
        }

        self.sync_groups(&sender, &name, groups, out);
    }

    /// Make our view of the peer's groups match the list in its HELLO.
    fn sync_groups(&mut self, peer: &str, name: &str, groups: Vec<String>, out: &mut Vec<Output>) {
        let wanted: BTreeSet<String> = groups.into_iter().collect();
        for group in self.groups.groups_of(peer) {
            if !wanted.contains(&group) && self.groups.leave(peer, &group) {
                out.push(Output::Event(Event::Leave {
                    peer: peer.to_string(),
                    name: name.to_string(),
                    group,
                }));
            }
        }
        for group in wanted {
            if self.groups.join(peer, &group) {
                out.push(Output::Event(Event::Join {
                    peer: peer.to_string(),
                    name: name.to_string(),
                    group,
                }));
            }
        }
    }

    fn check_status(&mut self, peer: &str, status: u8) {
        if let Some(p) = self.peers.get_mut(peer) {
            if !p.observe_status(status) {
                debug!("group status from {peer} jumped to {status}");
            }
        }
    }

    /// Drop a peer from the directory and every group. Emits `Exit` only
    /// for peers that completed the handshake.
    fn remove_peer(&mut self, id: &str, out: &mut Vec<Output>) -> Option<Peer> {
        let entered = self
            .peers
            .get(id)
            .is_some_and(|p| p.state != PeerState::Connecting);
        self.groups.leave_all(id);
        let peer = match self.peers.disconnect(id) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("{e}");
                self.peers.remove(id)?
            }
        };
        if entered {
            info!("peer {id} ({}) exited", peer.name);
            out.push(Output::Event(Event::Exit {
                peer: id.to_string(),
                name: peer.name.clone(),
            }));
        }
        out.push(Output::Disconnect {
            peer: id.to_string(),
        });
        Some(peer)
    }

    /// Run liveness checks and gossip introductions.
    pub fn tick(&mut self, now: Instant) -> Vec<Output> {
        let mut out = Vec::new();
        let Timeouts { evasive, expired } = self.timeouts;

        for id in self.peers.ids() {
            let Some(peer) = self.peers.get(&id) else {
                continue;
            };
            let silence = peer.silence(now);
            let state = peer.state;
            let probed = peer.probed();

            if state == PeerState::Connecting {
                if silence > expired {
                    debug!("handshake with {id} timed out");
                    self.remove_peer(&id, &mut out);
                }
                continue;
            }

            if silence > expired {
                if state == PeerState::Alive {
                    self.mark_evasive(&id, &mut out);
                }
                if let Err(e) = self.peers.transition(&id, PeerState::Expired) {
                    warn!("{e}");
                }
                self.remove_peer(&id, &mut out);
            } else if silence > evasive {
                if state == PeerState::Alive {
                    self.mark_evasive(&id, &mut out);
                    out.extend(self.ping(&id));
                }
            } else if state == PeerState::Alive && silence > evasive / 2 && !probed {
                out.extend(self.ping(&id));
            }
        }

        self.introduce(now, &mut out);
        out
    }

    fn mark_evasive(&mut self, id: &str, out: &mut Vec<Output>) {
        match self.peers.transition(id, PeerState::Evasive) {
            Ok(_) => {
                let name = self
                    .peers
                    .get(id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                info!("peer {id} ({name}) is evasive");
                out.push(Output::Event(Event::Evasive {
                    peer: id.to_string(),
                    name,
                }));
            }
            Err(e) => warn!("{e}"),
        }
    }

    fn ping(&mut self, id: &str) -> Option<Output> {
        self.peers.get_mut(id)?.set_probed();
        self.send_to(id, Message::Ping)
    }

    fn introduce(&mut self, now: Instant, out: &mut Vec<Output>) {
        if self.seeds.is_empty() {
            return;
        }
        let hello = encode(&Frame {
            sender: self.local.id.clone(),
            sequence: INTRODUCTION_SEQUENCE,
            message: self.hello_message(),
        });
        let retry = self.timeouts.evasive;
        for seed in &mut self.seeds {
            if seed.endpoint == self.local.endpoint
                || self.peers.find_by_endpoint(&seed.endpoint).is_some()
            {
                continue;
            }
            if seed
                .introduced
                .is_some_and(|at| now.saturating_duration_since(at) < retry)
            {
                continue;
            }
            debug!("introducing ourselves to {}", seed.endpoint);
            seed.introduced = Some(now);
            out.push(Output::Introduce {
                endpoint: seed.endpoint.clone(),
                frame: hello.clone(),
            });
        }
    }

    fn hello_message(&self) -> Message {
        Message::Hello {
            endpoint: self.local.endpoint.clone(),
            groups: self.local.groups(),
            status: self.local.status,
            name: self.local.name.clone(),
            headers: self.local.headers.clone(),
        }
    }

    /// HELLO always opens a fresh stream, so the send sequence restarts.
    fn hello_for(&mut self, id: &str) -> Option<Output> {
        self.peers.get_mut(id)?.reset_send_seq();
        let hello = self.hello_message();
        self.send_to(id, hello)
    }

    fn send_to(&mut self, id: &str, message: Message) -> Option<Output> {
        let peer = self.peers.get_mut(id)?;
        let sequence = peer.next_send_seq();
        let frame = encode(&Frame {
            sender: self.local.id.clone(),
            sequence,
            message,
        });
        Some(Output::Send {
            peer: id.to_string(),
            frame,
        })
    }

    pub fn join(&mut self, group: &str) -> Vec<Output> {
        if !self.local.groups.insert(group.to_string()) {
            debug!("already in group {group}");
            return Vec::new();
        }
        self.local.status = self.local.status.wrapping_add(1);
        info!("joined group {group}");
        let status = self.local.status;
        self.peers
            .ids()
            .into_iter()
            .filter_map(|id| {
                self.send_to(
                    &id,
                    Message::Join {
                        group: group.to_string(),
                        status,
                    },
                )
            })
            .collect()
    }

    pub fn leave(&mut self, group: &str) -> Vec<Output> {
        if !self.local.groups.remove(group) {
            debug!("not in group {group}");
            return Vec::new();
        }
        self.local.status = self.local.status.wrapping_add(1);
        info!("left group {group}");
        let status = self.local.status;
        self.peers
            .ids()
            .into_iter()
            .filter_map(|id| {
                self.send_to(
                    &id,
                    Message::Leave {
                        group: group.to_string(),
                        status,
                    },
                )
            })
            .collect()
    }

    pub fn whisper(&mut self, peer: &str, payload: Vec<u8>) -> Result<Vec<Output>, NodeError> {
        if !self.peers.is_ready(peer) {
            return Err(NodeError::UnknownPeer(peer.to_string()));
        }
        Ok(self
            .send_to(peer, Message::Whisper { payload })
            .into_iter()
            .collect())
    }

    /// Fan out to every member we know of. Members are independent sends.
    pub fn shout(&mut self, group: &str, payload: Vec<u8>) -> Vec<Output> {
        let members: Vec<String> = self
            .groups
            .members_of(group)
            .into_iter()
            .filter(|id| self.peers.is_ready(id))
            .collect();
        members
            .into_iter()
            .filter_map(|id| {
                self.send_to(
                    &id,
                    Message::Shout {
                        group: group.to_string(),
                        payload: payload.clone(),
                    },
                )
            })
            .collect()
    }

    /// Tell every peer we are leaving.
    pub fn stop(&mut self) -> Vec<Output> {
        if self.peers.is_empty() {
            info!("stopping, no peers to notify");
            return Vec::new();
        }
        info!("stopping, notifying {} peers", self.peers.len());
        self.peers
            .ids()
            .into_iter()
            .filter_map(|id| self.send_to(&id, Message::Stop))
            .collect()
    }

    /// Ids of peers that completed the handshake.
    pub fn peers(&self) -> Vec<String> {
        self.peers.ready_ids()
    }

    pub fn peers_by_group(&self, group: &str) -> Vec<String> {
        self.groups.members_of(group)
    }

    pub fn peer(&self, id: &str) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peer_state(&self, id: &str) -> Option<PeerState> {
        self.peers.get(id).map(|p| p.state)
    }

    pub fn peer_header_value(&self, id: &str, key: &str) -> Option<String> {
        self.peers.get(id)?.headers.get(key).cloned()
    }

    pub fn peer_address(&self, id: &str) -> Option<String> {
        self.peers
            .get(id)
            .filter(|p| p.is_ready())
            .map(|p| p.endpoint.clone())
    }

    /// Groups that at least one remote peer belongs to.
    pub fn peer_groups(&self) -> Vec<String> {
        self.groups.groups()
    }

    pub fn own_groups(&self) -> Vec<String> {
        self.local.groups()
    }
}
