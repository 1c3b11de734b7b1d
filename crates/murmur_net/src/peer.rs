//! Peer registry: tracking known peers and their connection state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::group::GroupTable;
use crate::identity::PeerId;

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Outbound link opened and HELLO sent, waiting to hear from the peer.
    Connecting,
    /// Handshake complete, peer is alive.
    Connected,
    /// Silent for longer than the evasive timeout.
    Evasive,
    /// Silent for longer than the expired timeout, or disconnected. Terminal:
    /// set on the record as it leaves the registry.
    Expired,
}

impl PeerStatus {
    /// Whether the peer has completed the handshake and not yet expired.
    pub fn is_entered(&self) -> bool {
        matches!(self, Self::Connected | Self::Evasive)
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Evasive => write!(f, "evasive"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Identifies one inbound mailbox connection.
pub type ConnId = u64;

/// One remote node.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    /// Mailbox address our outbound link connects to.
    pub endpoint: SocketAddr,
    pub name: String,
    /// Headers from the peer's HELLO.
    pub headers: BTreeMap<String, String>,
    /// Groups this peer has joined.
    pub groups: BTreeSet<String>,
    pub status: PeerStatus,
    /// Sequence number of the last frame we sent on the link.
    pub sent_sequence: u64,
    /// Highest sequence number accepted from the peer.
    pub recv_sequence: u64,
    /// Last beacon or frame from this peer.
    pub last_seen: Instant,
    /// Last PING we sent, if any.
    pub last_ping: Option<Instant>,
    /// Inbound connection currently carrying this peer's frames.
    pub inbound: Option<ConnId>,
    /// When our outbound link to the peer last failed, until it is reopened.
    pub link_failed: Option<Instant>,
    /// Wall-clock time of the ENTER, if it happened.
    pub connected_at: Option<DateTime<Utc>>,
    /// Position in creation order.
    created: u64,
}

impl Peer {
    pub fn new(id: PeerId, endpoint: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            endpoint,
            name: id.short(),
            headers: BTreeMap::new(),
            groups: BTreeSet::new(),
            status: PeerStatus::Connecting,
            sent_sequence: 0,
            recv_sequence: 0,
            last_seen: now,
            last_ping: None,
            inbound: None,
            link_failed: None,
            connected_at: None,
            created: 0,
        }
    }

    /// Claim the next outbound sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.sent_sequence += 1;
        self.sent_sequence
    }

    /// Whether a frame with `sequence` is a replay of one already accepted.
    pub fn is_duplicate(&self, sequence: u64) -> bool {
        self.status.is_entered() && sequence <= self.recv_sequence
    }

    /// Move to the terminal state, returning the state it left.
    pub fn expire(&mut self) -> PeerStatus {
        std::mem::replace(&mut self.status, PeerStatus::Expired)
    }

    /// Note activity from the peer.
    pub fn refresh(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn snapshot(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            endpoint: self.endpoint,
            name: self.name.clone(),
            headers: self.headers.clone(),
            groups: self.groups.iter().cloned().collect(),
            status: self.status,
            connected_at: self.connected_at,
        }
    }
}

/// Read-only view of a peer handed to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub endpoint: SocketAddr,
    pub name: String,
    pub headers: BTreeMap<String, String>,
    pub groups: Vec<String>,
    pub status: PeerStatus,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Registry of all known peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    next_created: u64,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer, replacing any previous record with the same id.
    pub fn insert(&mut self, mut peer: Peer) -> Option<Peer> {
        peer.created = self.next_created;
        self.next_created += 1;
        self.peers.insert(peer.id, peer)
    }

    /// Remove a peer and drop it from every group. Returns the record and
    /// the groups it left.
    pub fn remove(&mut self, id: &PeerId, groups: &mut GroupTable) -> Option<(Peer, Vec<String>)> {
        let peer = self.peers.remove(id)?;
        let left = groups.remove_peer(id);
        Some((peer, left))
    }

    pub fn lookup(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn lookup_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Peer ids, oldest first. A snapshot, so callers may remove peers while
    /// walking it.
    pub fn ids(&self) -> Vec<PeerId> {
        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by_key(|p| p.created);
        peers.into_iter().map(|p| p.id).collect()
    }

    /// All peers, oldest first.
    pub fn each(&self) -> impl Iterator<Item = &Peer> {
        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by_key(|p| p.created);
        peers.into_iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(port: u16) -> Peer {
        Peer::new(
            PeerId::generate(),
            format!("127.0.0.1:{port}").parse().unwrap(),
            Instant::now(),
        )
    }

    #[test]
    fn test_new_peer_defaults() {
        let peer = make_peer(9470);
        assert_eq!(peer.status, PeerStatus::Connecting);
        assert_eq!(peer.name, peer.id.short());
        assert_eq!(peer.sent_sequence, 0);
        assert!(peer.connected_at.is_none());
    }

    #[test]
    fn test_sequence_numbers() {
        let mut peer = make_peer(9471);
        assert_eq!(peer.next_sequence(), 1);
        assert_eq!(peer.next_sequence(), 2);

        peer.recv_sequence = 5;
        // Nothing counts as a duplicate before the handshake completes.
        assert!(!peer.is_duplicate(3));
        peer.status = PeerStatus::Connected;
        assert!(peer.is_duplicate(5));
        assert!(peer.is_duplicate(4));
        assert!(!peer.is_duplicate(6));
        peer.status = PeerStatus::Evasive;
        assert!(peer.is_duplicate(5));
    }

    #[test]
    fn test_expire_is_terminal() {
        let mut peer = make_peer(9473);
        peer.status = PeerStatus::Evasive;
        assert_eq!(peer.expire(), PeerStatus::Evasive);
        assert_eq!(peer.status, PeerStatus::Expired);
        assert!(!peer.status.is_entered());
        assert_eq!(peer.snapshot().status, PeerStatus::Expired);
        assert_eq!(peer.expire(), PeerStatus::Expired);
    }

    #[test]
    fn test_registry_insert_lookup_remove() {
        let mut registry = PeerRegistry::new();
        let mut groups = GroupTable::new();
        let peer = make_peer(9472);
        let id = peer.id;

        assert!(registry.insert(peer).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&id).is_some());

        groups.join_peer("CHAT", id);
        let (removed, left) = registry.remove(&id, &mut groups).unwrap();
        assert_eq!(removed.id, id);
        assert_eq!(left, vec!["CHAT".to_string()]);
        assert!(groups.get("CHAT").is_none());
        assert!(registry.is_empty());
        assert!(registry.remove(&id, &mut groups).is_none());
    }

    #[test]
    fn test_registry_iterates_in_creation_order() {
        let mut registry = PeerRegistry::new();
        let peers: Vec<Peer> = (0..8).map(|i| make_peer(9500 + i)).collect();
        let expected: Vec<PeerId> = peers.iter().map(|p| p.id).collect();
        for peer in peers {
            registry.insert(peer);
        }
        assert_eq!(registry.ids(), expected);
        let walked: Vec<PeerId> = registry.each().map(|p| p.id).collect();
        assert_eq!(walked, expected);
    }

    #[test]
    fn test_registry_replace_moves_to_back() {
        let mut registry = PeerRegistry::new();
        let first = make_peer(9480);
        let second = make_peer(9481);
        let first_id = first.id;
        registry.insert(first);
        registry.insert(second);

        let replaced = registry.insert(Peer::new(first_id, "127.0.0.1:9999".parse().unwrap(), Instant::now()));
        assert!(replaced.is_some());
        assert_eq!(registry.ids().last(), Some(&first_id));
        assert_eq!(registry.lookup(&first_id).unwrap().endpoint.port(), 9999);
    }

    #[test]
    fn test_snapshot() {
        let mut peer = make_peer(9490);
        peer.groups.insert("CHAT".to_string());
        peer.headers.insert("X-KEY".to_string(), "v".to_string());
        let info = peer.snapshot();
        assert_eq!(info.groups, vec!["CHAT".to_string()]);
        assert_eq!(info.headers.get("X-KEY").map(String::as_str), Some("v"));
        assert_eq!(info.status, PeerStatus::Connecting);
    }
}
