//! Peer identity: 16-byte node identifiers and the local node's identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for a peer node (a 16-byte UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a PeerId from its raw 16 bytes (as carried in a beacon).
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The raw 16 bytes of this ID.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// First six hex digits, used as the default peer name.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(6);
        s
    }
}

impl From<Uuid> for PeerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0.simple())
    }
}

/// The identity this node presents to its peers.
///
/// Built once before the node starts and never mutated while it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique peer identifier.
    pub peer_id: PeerId,
    /// Human-readable name for the node.
    pub name: String,
    /// Headers announced to every peer in HELLO.
    pub headers: BTreeMap<String, String>,
}

impl NodeIdentity {
    /// Create a new identity with a fresh PeerId. An empty name falls back to
    /// the short form of the ID.
    pub fn generate(name: impl Into<String>) -> Self {
        let peer_id = PeerId::generate();
        let name = name.into();
        let name = if name.is_empty() { peer_id.short() } else { name };
        Self {
            peer_id,
            name,
            headers: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_peer_id_bytes() {
        let id = PeerId::generate();
        let back = PeerId::from_bytes(*id.as_bytes());
        assert_eq!(id, back);
    }

    #[test]
    fn test_peer_id_display_is_uppercase_hex() {
        let id = PeerId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "AB".repeat(16));
        assert_eq!(id.short(), "ABABAB");
    }

    #[test]
    fn test_identity_generate() {
        let identity = NodeIdentity::generate("test-node");
        assert_eq!(identity.name, "test-node");
        assert!(identity.headers.is_empty());
    }

    #[test]
    fn test_identity_empty_name_uses_short_id() {
        let identity = NodeIdentity::generate("");
        assert_eq!(identity.name, identity.peer_id.short());
        assert_eq!(identity.name.len(), 6);
    }
}
