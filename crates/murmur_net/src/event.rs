//! Application-facing events and the commands that drive a running node.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::identity::PeerId;
use crate::peer::PeerInfo;

/// Something that happened on the network, in the order it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A peer completed the handshake.
    Enter {
        peer: PeerId,
        name: String,
        headers: BTreeMap<String, String>,
        endpoint: SocketAddr,
    },
    /// A peer is gone: expired, disconnected, or dropped at shutdown.
    Exit { peer: PeerId, name: String },
    /// A peer has been silent longer than the evasive timeout.
    Evasive { peer: PeerId, name: String },
    Join {
        peer: PeerId,
        name: String,
        group: String,
    },
    Leave {
        peer: PeerId,
        name: String,
        group: String,
    },
    Whisper {
        peer: PeerId,
        name: String,
        payload: Vec<u8>,
    },
    Shout {
        peer: PeerId,
        name: String,
        group: String,
        payload: Vec<u8>,
    },
    /// The node has shut down. Always the last event.
    Stop,
}

/// Tag of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Enter,
    Exit,
    Evasive,
    Join,
    Leave,
    Whisper,
    Shout,
    Stop,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Enter => "ENTER",
            Self::Exit => "EXIT",
            Self::Evasive => "EVASIVE",
            Self::Join => "JOIN",
            Self::Leave => "LEAVE",
            Self::Whisper => "WHISPER",
            Self::Shout => "SHOUT",
            Self::Stop => "STOP",
        };
        f.write_str(s)
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Enter { .. } => EventKind::Enter,
            Self::Exit { .. } => EventKind::Exit,
            Self::Evasive { .. } => EventKind::Evasive,
            Self::Join { .. } => EventKind::Join,
            Self::Leave { .. } => EventKind::Leave,
            Self::Whisper { .. } => EventKind::Whisper,
            Self::Shout { .. } => EventKind::Shout,
            Self::Stop => EventKind::Stop,
        }
    }

    /// The peer the event is about. `None` only for [`Event::Stop`].
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            Self::Enter { peer, .. }
            | Self::Exit { peer, .. }
            | Self::Evasive { peer, .. }
            | Self::Join { peer, .. }
            | Self::Leave { peer, .. }
            | Self::Whisper { peer, .. }
            | Self::Shout { peer, .. } => Some(*peer),
            Self::Stop => None,
        }
    }

    /// The group for JOIN, LEAVE and SHOUT.
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Join { group, .. } | Self::Leave { group, .. } | Self::Shout { group, .. } => {
                Some(group)
            }
            _ => None,
        }
    }

    /// The payload for WHISPER and SHOUT.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Whisper { payload, .. } | Self::Shout { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// A header the peer announced. Only ENTER carries headers.
    pub fn header(&self, key: &str) -> Option<&str> {
        match self {
            Self::Enter { headers, .. } => headers.get(key).map(String::as_str),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enter {
                peer,
                name,
                endpoint,
                ..
            } => write!(f, "ENTER {name} [{}] at {endpoint}", peer.short()),
            Self::Exit { peer, name } | Self::Evasive { peer, name } => {
                write!(f, "{} {name} [{}]", self.kind(), peer.short())
            }
            Self::Join { peer, name, group } | Self::Leave { peer, name, group } => {
                write!(f, "{} {name} [{}] {group}", self.kind(), peer.short())
            }
            Self::Whisper { peer, name, payload } => {
                write!(f, "WHISPER {name} [{}] ({} bytes)", peer.short(), payload.len())
            }
            Self::Shout {
                peer,
                name,
                group,
                payload,
            } => write!(
                f,
                "SHOUT {name} [{}] {group} ({} bytes)",
                peer.short(),
                payload.len()
            ),
            Self::Stop => f.write_str("STOP"),
        }
    }
}

/// Read-only questions about engine state, answered over a oneshot.
#[derive(Debug)]
pub enum Query {
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    OwnGroups(oneshot::Sender<Vec<String>>),
    PeerGroups(PeerId, oneshot::Sender<Option<Vec<String>>>),
    PeersByGroup(String, oneshot::Sender<Vec<PeerId>>),
    PeerHeader(PeerId, String, oneshot::Sender<Option<String>>),
}

/// Instructions from the application to the engine.
#[derive(Debug)]
pub enum Command {
    Join(String),
    Leave(String),
    Whisper(PeerId, Vec<u8>),
    Shout(String, Vec<u8>),
    Query(Query),
    /// Orderly shutdown: EXIT every peer, then emit [`Event::Stop`].
    Stop,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let peer = PeerId::generate();
        let shout = Event::Shout {
            peer,
            name: "b".to_string(),
            group: "CHAT".to_string(),
            payload: b"hello".to_vec(),
        };
        assert_eq!(shout.kind(), EventKind::Shout);
        assert_eq!(shout.peer(), Some(peer));
        assert_eq!(shout.group(), Some("CHAT"));
        assert_eq!(shout.payload(), Some(&b"hello"[..]));

        let exit = Event::Exit {
            peer,
            name: "b".to_string(),
        };
        assert!(exit.group().is_none());
        assert!(exit.payload().is_none());
        assert_eq!(Event::Stop.peer(), None);
    }

    #[test]
    fn test_enter_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("X-ROLE".to_string(), "hub".to_string());
        let enter = Event::Enter {
            peer: PeerId::generate(),
            name: "a".to_string(),
            headers,
            endpoint: "10.0.0.2:6000".parse().unwrap(),
        };
        assert_eq!(enter.header("X-ROLE"), Some("hub"));
        assert_eq!(enter.header("X-MISSING"), None);
        assert_eq!(Event::Stop.header("X-ROLE"), None);
    }

    #[test]
    fn test_event_display() {
        let peer = PeerId::from_bytes([0xAB; 16]);
        let enter = Event::Enter {
            peer,
            name: "a".to_string(),
            headers: BTreeMap::new(),
            endpoint: "10.0.0.2:6000".parse().unwrap(),
        };
        assert_eq!(enter.to_string(), "ENTER a [ABABAB] at 10.0.0.2:6000");

        let shout = Event::Shout {
            peer,
            name: "a".to_string(),
            group: "CHAT".to_string(),
            payload: b"hello".to_vec(),
        };
        assert_eq!(shout.to_string(), "SHOUT a [ABABAB] CHAT (5 bytes)");

        let leave = Event::Leave {
            peer,
            name: "a".to_string(),
            group: "CHAT".to_string(),
        };
        assert_eq!(leave.to_string(), "LEAVE a [ABABAB] CHAT");
        assert_eq!(
            Event::Evasive { peer, name: "a".to_string() }.to_string(),
            "EVASIVE a [ABABAB]"
        );
        assert_eq!(Event::Stop.to_string(), "STOP");
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::Enter.to_string(), "ENTER");
        assert_eq!(EventKind::Evasive.to_string(), "EVASIVE");
        assert_eq!(Event::Stop.kind().to_string(), "STOP");
    }
}
