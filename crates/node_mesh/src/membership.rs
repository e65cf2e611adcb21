//! Peer liveness states: Connecting, Alive, Evasive, Expired, Disconnected.

use std::time::{Duration, Instant};

use node_proto::Headers;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Connecting,
    Alive,
    Evasive,
    Expired,
    Disconnected,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Alive => write!(f, "Alive"),
            Self::Evasive => write!(f, "Evasive"),
            Self::Expired => write!(f, "Expired"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

impl PeerState {
    pub fn can_become(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Connecting, Alive)
                | (Connecting, Disconnected)
                | (Alive, Evasive)
                | (Evasive, Alive)
                | (Evasive, Expired)
                | (Expired, Disconnected)
                | (Alive, Disconnected)
                | (Evasive, Disconnected)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("peer {peer}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub peer: String,
    pub from: PeerState,
    pub to: PeerState,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub headers: Headers,
    pub state: PeerState,
    pub last_seen: Instant,
    send_seq: u16,
    recv_seq: u16,
    status: u8,
    probed: bool,
}

impl Peer {
    pub fn new(id: &str, endpoint: &str, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            endpoint: endpoint.to_string(),
            headers: Headers::new(),
            state: PeerState::Connecting,
            last_seen: now,
            send_seq: 0,
            recv_seq: 0,
            status: 0,
            probed: false,
        }
    }

    /// Has this peer completed the handshake and not yet left?
    pub fn is_ready(&self) -> bool {
        matches!(self.state, PeerState::Alive | PeerState::Evasive)
    }

    pub fn transition(&mut self, next: PeerState) -> Result<PeerState, TransitionError> {
        if !self.state.can_become(next) {
            return Err(TransitionError {
                peer: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        Ok(std::mem::replace(&mut self.state, next))
    }

    /// Record traffic. Returns true when this revived an evasive peer.
    pub fn mark_seen(&mut self, now: Instant) -> bool {
        self.last_seen = now;
        self.probed = false;
        if self.state == PeerState::Evasive {
            self.state = PeerState::Alive;
            return true;
        }
        false
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub(crate) fn next_send_seq(&mut self) -> u16 {
        self.send_seq = self.send_seq.wrapping_add(1);
        self.send_seq
    }

    /// A fresh stream starts counting from zero again.
    pub(crate) fn reset_send_seq(&mut self) {
        self.send_seq = 0;
    }

    pub(crate) fn reset_recv_seq(&mut self, sequence: u16) {
        self.recv_seq = sequence;
    }

    /// Accept `sequence` if it is the next one expected.
    pub(crate) fn accept_sequence(&mut self, sequence: u16) -> bool {
        if sequence != self.recv_seq.wrapping_add(1) {
            return false;
        }
        self.recv_seq = sequence;
        true
    }

    pub(crate) fn expected_sequence(&self) -> u16 {
        self.recv_seq.wrapping_add(1)
    }

    pub(crate) fn set_status(&mut self, status: u8) {
        self.status = status;
    }

    /// Each JOIN/LEAVE bumps the sender's status by one. Returns false on a gap.
    pub(crate) fn observe_status(&mut self, status: u8) -> bool {
        let expected = self.status.wrapping_add(1);
        self.status = status;
        status == expected
    }

    pub(crate) fn probed(&self) -> bool {
        self.probed
    }

    pub(crate) fn set_probed(&mut self) {
        self.probed = true;
    }
}
