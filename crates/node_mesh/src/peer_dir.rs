//! Peer directory: every remote node this engine knows about, keyed by id.
//!
//! Only the engine mutates the directory. A peer that reaches
//! `Disconnected` is removed in the same call, so there are no zombie entries.

use std::collections::HashMap;
use std::time::Instant;

use node_proto::Headers;
use thiserror::Error;

use crate::membership::{Peer, PeerState, TransitionError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("peer {0} is not in the directory")]
    UnknownPeer(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// What a HELLO did to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First handshake for this id: emit `Enter`.
    Entered,
    /// Known peer came back on a different endpoint.
    Reconnected,
    /// Same peer, same endpoint.
    Refreshed,
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<String, Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a peer we heard a beacon from but have not shaken hands with.
    /// Returns false if the id is already known.
    pub fn insert_connecting(&mut self, id: &str, endpoint: &str, now: Instant) -> bool {
        if self.peers.contains_key(id) {
            return false;
        }
        self.peers
            .insert(id.to_string(), Peer::new(id, endpoint, now));
        true
    }

    /// Apply a handshake. Headers and name are replaced wholesale.
    pub fn upsert(
        &mut self,
        id: &str,
        endpoint: &str,
        name: &str,
        headers: Headers,
        now: Instant,
    ) -> Result<Upsert, RegistryError> {
        let peer = self
            .peers
            .entry(id.to_string())
            .or_insert_with(|| Peer::new(id, endpoint, now));

        let outcome = if peer.state == PeerState::Connecting {
            peer.transition(PeerState::Alive)?;
            Upsert::Entered
        } else if peer.endpoint != endpoint {
            Upsert::Reconnected
        } else {
            Upsert::Refreshed
        };

        peer.endpoint = endpoint.to_string();
        peer.name = name.to_string();
        peer.headers = headers;
        peer.mark_seen(now);
        Ok(outcome)
    }

    /// Returns `Some(true)` when the peer was evasive and is now alive again.
    pub fn mark_seen(&mut self, id: &str, now: Instant) -> Option<bool> {
        self.peers.get_mut(id).map(|peer| peer.mark_seen(now))
    }

    pub fn transition(&mut self, id: &str, next: PeerState) -> Result<PeerState, RegistryError> {
        let peer = self
            .peers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownPeer(id.to_string()))?;
        Ok(peer.transition(next)?)
    }

    /// Move the peer to `Disconnected` and drop it.
    pub fn disconnect(&mut self, id: &str) -> Result<Peer, RegistryError> {
        self.transition(id, PeerState::Disconnected)?;
        self.peers
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownPeer(id.to_string()))
    }

    pub fn remove(&mut self, id: &str) -> Option<Peer> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.peers.get(id).is_some_and(Peer::is_ready)
    }

    pub fn all(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Peers that completed the handshake, sorted by id.
    pub fn ready_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .all()
            .filter(|p| p.is_ready())
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn find_by_endpoint(&self, endpoint: &str) -> Option<&Peer> {
        self.peers.values().find(|p| p.endpoint == endpoint)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn upsert_unknown_enters_alive() {
        let now = Instant::now();
        let mut dir = PeerDirectory::new();
        let outcome = dir
            .upsert("n1", "10.0.0.1:4000", "alice", headers(&[("X-Role", "chat")]), now)
            .unwrap();

        assert_eq!(outcome, Upsert::Entered);
        let peer = dir.get("n1").unwrap();
        assert_eq!(peer.state, PeerState::Alive);
        assert_eq!(peer.name, "alice");
        assert_eq!(peer.headers["X-Role"], "chat");
    }

    #[test]
    fn connecting_peer_enters_on_handshake() {
        let now = Instant::now();
        let mut dir = PeerDirectory::new();
        assert!(dir.insert_connecting("n1", "10.0.0.1:4000", now));
        assert!(!dir.insert_connecting("n1", "10.0.0.1:4000", now));
        assert!(!dir.is_ready("n1"));
        assert!(dir.ready_ids().is_empty());

        let outcome = dir
            .upsert("n1", "10.0.0.1:4000", "alice", Headers::new(), now)
            .unwrap();
        assert_eq!(outcome, Upsert::Entered);
        assert_eq!(dir.ready_ids(), vec!["n1".to_string()]);
    }

    #[test]
    fn repeat_handshake_is_refresh_or_reconnect() {
        let now = Instant::now();
        let mut dir = PeerDirectory::new();
        dir.upsert("n1", "10.0.0.1:4000", "alice", headers(&[("a", "1")]), now)
            .unwrap();

        let same = dir
            .upsert("n1", "10.0.0.1:4000", "alice", headers(&[("a", "1")]), now)
            .unwrap();
        assert_eq!(same, Upsert::Refreshed);

        let moved = dir
            .upsert("n1", "10.0.0.1:4001", "alice", headers(&[("b", "2")]), now)
            .unwrap();
        assert_eq!(moved, Upsert::Reconnected);

        let peer = dir.get("n1").unwrap();
        assert_eq!(peer.endpoint, "10.0.0.1:4001");
        assert!(peer.headers.get("a").is_none());
        assert_eq!(peer.headers["b"], "2");
    }

    #[test]
    fn reconnect_revives_evasive_peer() {
        let now = Instant::now();
        let mut dir = PeerDirectory::new();
        dir.upsert("n1", "a:1", "alice", Headers::new(), now).unwrap();
        dir.transition("n1", PeerState::Evasive).unwrap();

        dir.upsert("n1", "a:2", "alice", Headers::new(), now).unwrap();
        assert_eq!(dir.get("n1").unwrap().state, PeerState::Alive);
    }

    #[test]
    fn disconnect_removes_entry() {
        let now = Instant::now();
        let mut dir = PeerDirectory::new();
        dir.upsert("n1", "a:1", "alice", Headers::new(), now).unwrap();

        let peer = dir.disconnect("n1").unwrap();
        assert_eq!(peer.state, PeerState::Disconnected);
        assert!(dir.get("n1").is_none());
        assert!(dir.is_empty());
        assert!(matches!(
            dir.disconnect("n1"),
            Err(RegistryError::UnknownPeer(_))
        ));
    }

    #[test]
    fn illegal_transition_leaves_state() {
        let now = Instant::now();
        let mut dir = PeerDirectory::new();
        dir.insert_connecting("n1", "a:1", now);

        let err = dir.transition("n1", PeerState::Expired).unwrap_err();
        assert!(matches!(err, RegistryError::Transition(_)));
        assert_eq!(dir.get("n1").unwrap().state, PeerState::Connecting);
    }

    #[test]
    fn lookup_by_endpoint() {
        let now = Instant::now();
        let mut dir = PeerDirectory::new();
        dir.upsert("n1", "10.0.0.1:4000", "alice", Headers::new(), now)
            .unwrap();
        dir.upsert("n2", "10.0.0.2:4000", "bob", Headers::new(), now)
            .unwrap();

        assert_eq!(dir.find_by_endpoint("10.0.0.2:4000").unwrap().id, "n2");
        assert!(dir.find_by_endpoint("10.0.0.3:4000").is_none());
        assert_eq!(dir.ids(), vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(dir.len(), 2);
    }
}
